//! Projection error types.

use domain::DecodeError;
use storage::StoreError;
use thiserror::Error;

/// Errors that can occur while applying an event to a read model.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// The event body did not match its type. Never retried in-process.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The read store rejected the mutation.
    #[error("Read store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;
