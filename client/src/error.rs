//! Error types for the Carry client.

use crate::OperationId;
use std::time::Duration;
use thiserror::Error;

/// All possible errors from the Carry client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Remote errors
    #[error("network error: {0}")]
    Network(String),

    #[error("remote store rejected operation: {0}")]
    Rejected(String),

    // Conflict errors
    #[error("unresolved conflict on {0}")]
    Conflict(String),

    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("conflict already resolved: {0}")]
    ConflictAlreadyResolved(String),

    #[error("'pending' is not a resolution")]
    InvalidResolution,

    // Operation errors
    #[error("optimistic update timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation {id} failed permanently after {attempts} attempts: {last_error}")]
    PermanentFailure {
        id: OperationId,
        attempts: u32,
        last_error: String,
    },

    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    // Persistence errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl Error {
    /// Whether a remote operation failing with this error should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_))
    }

    /// Whether this error was raised by local validation of a call.
    ///
    /// Validation errors are returned synchronously and the write is never
    /// enqueued.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidPath(_)
                | Error::InvalidPayload(_)
                | Error::CollectionNotFound(_)
                | Error::MissingRequiredField(_)
                | Error::TypeMismatch { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
