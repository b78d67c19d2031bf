//! Durable state for Anchorite.
//!
//! The database is the single source of truth for every mutable entity:
//! publish jobs, nonce records, the UTXO pool, the signer registry, and the
//! append-only audit log. Correctness under concurrency comes from
//! database-level locking (unique constraints, conditional updates, and
//! skip-locked claims), never from in-process mutexes, so any number of
//! worker processes can share one store.
//!
//! - [`traits`] - The storage port traits every backend implements
//! - [`types`] - Row types and state enums
//! - [`postgres`] - The production backend (sqlx / PgPool)
//! - [`memory`] - An in-memory double with the same atomicity guarantees,
//!   for tests and local development (feature `mock`)

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod error;
pub mod postgres;
pub mod traits;
pub mod types;

#[cfg(any(test, feature = "mock"))]
pub mod memory;

pub use error::{StoreError, StoreResult};
pub use postgres::PgStore;
pub use traits::{AuditLog, JobStore, SignerRegistry, Store, UtxoPool};
pub use types::{
    AdmitRequest, Admitted, AuditEvent, BatchId, JobId, JobStatus, NewAuditEvent, NewUtxo,
    PoolStats, PublishJob, ReservedUtxo, SignerRecord, SignerStatus, TransitionFields, Utxo,
    UtxoPurpose, UtxoStatus,
};

#[cfg(any(test, feature = "mock"))]
pub use memory::MemoryStore;
