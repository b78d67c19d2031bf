//! Store error type.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The (signer, nonce) pair already exists.
    #[error("nonce already seen for this signer")]
    Replay,

    /// A row the caller expected was not there.
    #[error("not found: {0}")]
    NotFound(String),

    /// A conditional write found the row in a different state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backing database failed.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}
