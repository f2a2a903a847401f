//! # tfop-api
//!
//! The training-job resource as the controller sees it.
//!
//! ## Design Principles
//!
//! - The model covers what the reconciliation core reads; pod template
//!   fields it does not interpret are carried through untouched
//! - Replica types are a closed set, parsed case-insensitively and written
//!   in their canonical spelling
//! - Values are plain owned data: cloning a job yields a fully independent
//!   copy, so a snapshot never aliases the cache it was read from
//!
//! ## Modules
//!
//! - `types`: job, spec, status and replica definitions
//! - `defaults`: schema defaulting applied before reconciliation

mod defaults;
mod error;
mod types;

pub use defaults::set_defaults;
pub use error::ModelError;
pub use types::*;

/// Name the controller reports itself as.
pub const CONTROLLER_NAME: &str = "tf-operator";

/// API group of the job resource.
pub const GROUP_NAME: &str = "kubeflow.org";

/// Kind of the job resource.
pub const KIND: &str = "TFJob";

/// Label carrying a replica's type on subordinate pods and services.
pub const REPLICA_TYPE_LABEL: &str = "replica-type";

/// Label carrying a replica's ordinal index.
pub const REPLICA_INDEX_LABEL: &str = "replica-index";

/// Label carrying the API group that owns a subordinate resource.
pub const GROUP_NAME_LABEL: &str = "group-name";

/// Deprecated job-name label, still written for older tooling.
pub const JOB_NAME_LABEL: &str = "tf-job-name";

/// Container the defaulter and the engine treat as the training process.
pub const DEFAULT_CONTAINER_NAME: &str = "tensorflow";

/// Name of the port used for intra-job communication.
pub const DEFAULT_PORT_NAME: &str = "tfjob-port";

/// Port number used when a replica template does not declare one.
pub const DEFAULT_PORT: i32 = 2222;
