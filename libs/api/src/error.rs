//! Error types for the job model.

use thiserror::Error;

/// Errors that can occur when interpreting job model values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// The replica type is not one the controller knows.
    #[error("unknown replica type: {0}")]
    UnknownReplicaType(String),
}
