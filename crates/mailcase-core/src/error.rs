//! Error types for mailcase.

use thiserror::Error;

use crate::store::StoreError;

/// Result type alias using mailcase's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for mailcase operations.
///
/// Most of these never reach a caller of the refresh pipeline: store faults
/// and cancellations are absorbed upstream and only commit-stage failures are
/// surfaced. An elapsed wait is not an error at all; it shows up as a flag in
/// the refresh report.
#[derive(Error, Debug)]
pub enum Error {
    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Event not found
    #[error("Event not found: {0}")]
    EventNotFound(uuid::Uuid),

    /// Mail store operation failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Event repository operation failed
    #[error("Repository error: {0}")]
    Repository(String),

    /// The operation was superseded or explicitly cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error represents a normal, expected outcome rather than a
    /// fault: supersession, an event deleted meanwhile, an exhausted lookup.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Error::Cancelled
                | Error::EventNotFound(_)
                | Error::Store(StoreError::NotFound)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
