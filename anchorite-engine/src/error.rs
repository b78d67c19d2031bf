//! Engine error type.

use thiserror::Error;

use anchorite_core::AdmissionError;
use anchorite_ledger::LedgerError;
use anchorite_store::StoreError;

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors crossing engine boundaries.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The intent was rejected by the admission pipeline.
    #[error(transparent)]
    Rejected(#[from] AdmissionError),

    /// The storage layer failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The ledger layer failed.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Invalid engine configuration.
    #[error("configuration error: {0}")]
    Config(String),
}
