//! Error taxonomy for admission and worker outcomes.
//!
//! The taxonomy is a contract, not an implementation detail: every kind is
//! surfaced verbatim in `publish_jobs.error_code` and mapped to an HTTP
//! status at the admission surface. Control flow through the admission
//! pipeline is a typed error return, never unwinding.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Errors from the core primitives (hashing, key parsing).
#[derive(Debug, Error)]
pub enum CoreError {
    /// A hash string failed to parse.
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    /// A public or secret key failed to parse.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A record body failed structural validation.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

/// The stable outcome taxonomy recorded on job rows and returned to clients.
///
/// `as_str()` values are the persistence contract; renaming one is a
/// breaking schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Envelope or record failed the structural schema check.
    InvalidSchema,
    /// Record timestamp outside the permitted skew window.
    StaleTimestamp,
    /// The (signer, nonce) pair was already seen.
    ReplayDetected,
    /// ECDSA verification failed against the record hash.
    InvalidSignature,
    /// Signer not registered, or registered but revoked.
    UnknownSigner,
    /// Identical record body already admitted; the prior job is returned.
    DuplicateRecord,
    /// No publish UTXO was available for reservation.
    NoCapacity,
    /// The ledger reported the input already spent in a mempool transaction.
    MempoolConflict,
    /// Broadcast RPC timed out or returned a server error.
    TransientNetwork,
    /// Broadcast RPC rejected the transaction permanently.
    PermanentReject,
    /// Local transaction building failed.
    BuildError,
}

impl ErrorKind {
    /// The verbatim code persisted in `publish_jobs.error_code`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidSchema => "InvalidSchema",
            ErrorKind::StaleTimestamp => "StaleTimestamp",
            ErrorKind::ReplayDetected => "ReplayDetected",
            ErrorKind::InvalidSignature => "InvalidSignature",
            ErrorKind::UnknownSigner => "UnknownSigner",
            ErrorKind::DuplicateRecord => "DuplicateRecord",
            ErrorKind::NoCapacity => "NoCapacity",
            ErrorKind::MempoolConflict => "MempoolConflict",
            ErrorKind::TransientNetwork => "TransientNetwork",
            ErrorKind::PermanentReject => "PermanentReject",
            ErrorKind::BuildError => "BuildError",
        }
    }

    /// HTTP status for admission-time rejections.
    ///
    /// Worker-time kinds are never returned synchronously; they map to 500
    /// here only as a guard.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::InvalidSchema => 400,
            ErrorKind::StaleTimestamp => 400,
            ErrorKind::InvalidSignature => 400,
            ErrorKind::ReplayDetected => 409,
            ErrorKind::UnknownSigner => 403,
            ErrorKind::DuplicateRecord => 200,
            _ => 500,
        }
    }

    /// Whether this kind can be produced by the admission pipeline.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            ErrorKind::InvalidSchema
                | ErrorKind::StaleTimestamp
                | ErrorKind::ReplayDetected
                | ErrorKind::InvalidSignature
                | ErrorKind::UnknownSigner
                | ErrorKind::DuplicateRecord
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejection from the admission pipeline.
#[derive(Debug, Error)]
pub struct AdmissionError {
    /// Which check failed.
    pub kind: ErrorKind,
    /// Human-readable detail, never required for dispatch.
    pub detail: Option<String>,
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl AdmissionError {
    /// Create an admission error without detail.
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, detail: None }
    }

    /// Create an admission error with detail.
    pub fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: Some(detail.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_verbatim() {
        assert_eq!(ErrorKind::ReplayDetected.as_str(), "ReplayDetected");
        assert_eq!(ErrorKind::MempoolConflict.as_str(), "MempoolConflict");
        assert_eq!(ErrorKind::NoCapacity.as_str(), "NoCapacity");
    }

    #[test]
    fn admission_statuses() {
        assert_eq!(ErrorKind::InvalidSchema.http_status(), 400);
        assert_eq!(ErrorKind::StaleTimestamp.http_status(), 400);
        assert_eq!(ErrorKind::ReplayDetected.http_status(), 409);
        assert_eq!(ErrorKind::UnknownSigner.http_status(), 403);
    }

    #[test]
    fn admission_partition() {
        assert!(ErrorKind::ReplayDetected.is_admission());
        assert!(!ErrorKind::MempoolConflict.is_admission());
        assert!(!ErrorKind::NoCapacity.is_admission());
    }

    #[test]
    fn display_includes_detail() {
        let e = AdmissionError::with_detail(ErrorKind::StaleTimestamp, "skew 601s");
        assert_eq!(e.to_string(), "StaleTimestamp: skew 601s");

        let e = AdmissionError::new(ErrorKind::InvalidSignature);
        assert_eq!(e.to_string(), "InvalidSignature");
    }
}
