//! Anchorite Core - Fundamental types for the Anchorite anchoring service.
//!
//! This crate provides the primitives shared by every other Anchorite crate:
//!
//! - [`canonical`] - Deterministic JSON canonicalization and SHA-256 record hashing
//! - [`crypto`] - secp256k1 keys and ECDSA (DER) signature verification
//! - [`intent`] - The publishing-intent envelope and the rights record it carries
//! - [`error`] - The admission/worker error taxonomy recorded on job rows
//!
//! # Example
//!
//! ```rust
//! use anchorite_core::canonical::{canonicalize, record_hash};
//! use serde_json::json;
//!
//! let record = json!({"recordId": "REC-1", "nonce": "n1"});
//! let shuffled = json!({"nonce": "n1", "recordId": "REC-1"});
//!
//! // Structurally equal values canonicalize to identical bytes.
//! assert_eq!(canonicalize(&record), canonicalize(&shuffled));
//! assert_eq!(record_hash(&record), record_hash(&shuffled));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod intent;

// Re-exports for convenience
pub use canonical::{canonicalize, content_hash, record_hash, RecordHash};
pub use crypto::{verify_record_signature, ServerKey, SignerKey};
pub use error::{AdmissionError, ErrorKind};
pub use intent::{
    DistributionHint, EventKind, OwnerSplit, PublishIntent, RightsRecord, SignatureBlock,
    SignerRef, Terms,
};

/// Wire protocol tag carried in every envelope and on-ledger payload.
pub const PROTOCOL_TAG: &str = "sl-drm";

/// Wire protocol version.
pub const PROTOCOL_VERSION: u32 = 1;
