//! Error types for job key parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or building job keys.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The key string is empty.
    #[error("job key cannot be empty")]
    Empty,

    /// The key has no namespace segment.
    #[error("invalid job key {key:?}: namespace is missing")]
    MissingNamespace { key: String },

    /// The key has no name segment.
    #[error("invalid job key {key:?}: name is missing")]
    MissingName { key: String },

    /// The key has more than one `/` separator.
    #[error("unexpected job key format: {key:?}")]
    InvalidFormat { key: String },
}

impl KeyError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, KeyError::Empty)
    }
}
