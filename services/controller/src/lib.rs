//! tf-operator controller library
//!
//! Event-driven control loop that keeps distributed training jobs converged
//! to their declared state.
//!
//! ## Architecture
//!
//! ```text
//! JobStore ──notifications──▶ EventHandler ──keys──▶ WorkQueue
//!                                                       │
//!                                     workers (threadiness)
//!                                                       ▼
//!                    SnapshotAccessor ◀── JobSyncer ──▶ ReconcileEngine
//!                                            │
//!                                  ExpectationTracker
//! ```
//!
//! ## Modules
//!
//! - `store`: job cache, authoritative reads and notifications
//! - `ingest`: notification to queue-key translation
//! - `snapshot`: typed, owned job snapshots
//! - `sync`: one reconciliation pass per key
//! - `controller`: lifecycle and worker pool
//! - `engine`: reconciliation engine seam
//! - `recorder`: events attached to jobs
//! - `metrics`: controller counters and the Prometheus exporter

pub mod config;
pub mod controller;
pub mod engine;
pub mod ingest;
pub mod metrics;
pub mod recorder;
pub mod snapshot;
pub mod store;
pub mod sync;

pub use controller::{Collaborators, Controller, ControllerConfig, ControllerError};
pub use engine::{EngineError, LoggingEngine, ReconcileEngine};
pub use store::{JobStore, MemoryJobStore};
pub use sync::{JobSyncer, SyncError, SyncOutcome};
