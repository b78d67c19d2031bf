//! Error types for ledger operations.

use thiserror::Error;

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur while building or submitting transactions.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid locking script.
    #[error("invalid script: {0}")]
    InvalidScript(String),

    /// Data-carrier payload over the ledger's limit.
    #[error("payload too large: {len} > {max}")]
    PayloadTooLarge {
        /// Payload length.
        len: usize,
        /// Ledger limit.
        max: usize,
    },

    /// The input cannot cover fee plus outputs.
    #[error("insufficient input value: need {need} sat, have {have} sat")]
    InsufficientValue {
        /// Amount needed.
        need: u64,
        /// Amount available.
        have: u64,
    },

    /// Transaction building failed.
    #[error("transaction building failed: {0}")]
    TxBuild(String),

    /// Hex decode error.
    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Signing error.
    #[error("signing failed: {0}")]
    Signing(String),
}

impl From<bitcoin::address::ParseError> for LedgerError {
    fn from(e: bitcoin::address::ParseError) -> Self {
        LedgerError::InvalidAddress(e.to_string())
    }
}
