//! # tfop-id
//!
//! Job identity for the training-job controller.
//!
//! ## Design Principles
//!
//! - A job is addressed by its namespace-qualified name
//! - Keys have one canonical string form: `{namespace}/{name}`
//! - Parsing is strict: both parts must be non-empty and the name may not
//!   contain a further `/`
//! - Keys are what the work queue, caches and expectation records share
//!
//! Examples:
//! - `default/mnist`
//! - `ml-team/resnet-50-dist`

mod error;
mod key;

pub use error::KeyError;
pub use key::JobKey;
