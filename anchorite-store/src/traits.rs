//! Storage port traits.
//!
//! One trait per concern; a backend implements all of them over the same
//! underlying database so that `admit` and the claim paths can be single
//! transactions. Components take `Arc<dyn Store>` and never know which
//! backend they run on.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use anchorite_core::SignerKey;

use crate::error::StoreResult;
use crate::types::{
    AdmitRequest, Admitted, AuditEvent, BatchId, JobId, NewAuditEvent, NewUtxo, PoolStats,
    PublishJob, ReservedUtxo, SignerRecord, TransitionFields, Utxo,
};

/// Store for publish jobs and nonce records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Admit a validated intent in one transaction: insert the nonce row
    /// (unique-violation is a replay), insert the job with status `queued`
    /// (record-hash collision returns the prior job), and append the
    /// submission audit event.
    async fn admit(&self, req: AdmitRequest) -> StoreResult<Admitted>;

    /// Whether a (signer, nonce) pair has been seen. Read-only; the
    /// authoritative uniqueness check is the insert inside [`admit`].
    ///
    /// [`admit`]: JobStore::admit
    async fn nonce_seen(&self, signer: &SignerKey, nonce: &str) -> StoreResult<bool>;

    /// Conditional status update with `WHERE status = from`. Returns whether
    /// the transition applied. Every status write goes through here.
    async fn transition(
        &self,
        job_id: &JobId,
        from: crate::types::JobStatus,
        to: crate::types::JobStatus,
        fields: TransitionFields,
    ) -> StoreResult<bool>;

    /// Single-job worker path: atomically move the oldest `queued` job to
    /// `processing`. Skip-locked; concurrent workers never double-claim.
    async fn claim_oldest_queued(&self) -> StoreResult<Option<PublishJob>>;

    /// Collector path: atomically move up to `limit` oldest `queued` jobs to
    /// `processing_batch` under a fresh batch id, assigning dense sequence
    /// numbers 1..k in creation-time order. Skip-locked. Returns the claimed
    /// jobs in sequence order; an empty queue claims nothing and mints no
    /// batch.
    async fn claim_queued(&self, limit: u32) -> StoreResult<Vec<PublishJob>>;

    /// Broadcaster path: atomically move the lowest-seq `processing_batch`
    /// job of the batch to `sending` and stamp `sending_started_at`.
    async fn claim_next_in_batch(&self, batch_id: &BatchId) -> StoreResult<Option<PublishJob>>;

    /// Revert any `sending` job older than `ttl` back to `processing_batch`
    /// and clear its `sending_started_at`. Returns how many were reverted.
    /// Run on startup and periodically.
    async fn unstick(&self, ttl: Duration) -> StoreResult<u64>;

    /// The batch id with the smallest MIN(created_at) among jobs still in
    /// `processing_batch` or `sending`.
    async fn oldest_active_batch(&self) -> StoreResult<Option<BatchId>>;

    /// Fetch a job by its public id.
    async fn job(&self, job_id: &JobId) -> StoreResult<Option<PublishJob>>;

    /// Fetch the most recently created job for an external record id.
    async fn latest_job_for_record(&self, record_id: &str) -> StoreResult<Option<PublishJob>>;

    /// Liveness probe: round-trip the backend.
    async fn ping(&self) -> StoreResult<()>;
}

/// The atomic reservation engine over the pool of single-use inputs.
#[async_trait]
pub trait UtxoPool: Send + Sync {
    /// Reserve one clean publish input, smallest value first (ties broken by
    /// age), leasing it until now + `lease`. Expired leases are swept back to
    /// available in the same transaction, so a stuck worker can never starve
    /// the pool. Returns `None` when nothing is selectable.
    ///
    /// Concurrent callers each obtain a distinct row or `None`; no two
    /// callers ever observe the same `available → reserved` transition.
    async fn reserve(&self, lease: Duration) -> StoreResult<Option<ReservedUtxo>>;

    /// Irreversibly mark an input spent by `ledger_txid`. Returns `false`
    /// when the row was not `reserved` at the time — the lease was lost to
    /// the sweeper — which callers log as an inconsistency.
    async fn mark_spent(&self, utxo_id: i64, ledger_txid: &str) -> StoreResult<bool>;

    /// Return a reserved input to the pool (transient failure path).
    async fn release(&self, utxo_id: i64) -> StoreResult<()>;

    /// Return an input to the pool but exclude it from selection until an
    /// out-of-band reconciliation clears it (mempool-conflict path).
    async fn mark_dirty(&self, utxo_id: i64) -> StoreResult<()>;

    /// Insert new pool rows (bootstrap or replenisher). Duplicate
    /// (txid, vout) pairs are skipped. Returns how many were inserted.
    async fn insert_utxos(&self, rows: &[NewUtxo]) -> StoreResult<u64>;

    /// Pool depth counters; `unit_value` selects which denomination counts
    /// as splittable publish capacity.
    async fn pool_stats(&self, unit_value: u64) -> StoreResult<PoolStats>;

    /// The largest clean available funding/change input, if any.
    async fn largest_source(&self) -> StoreResult<Option<Utxo>>;

    /// Fetch one input row by id.
    async fn utxo(&self, utxo_id: i64) -> StoreResult<Option<Utxo>>;
}

/// The flat signer registry.
#[async_trait]
pub trait SignerRegistry: Send + Sync {
    /// Look up a signer.
    async fn signer(&self, key: &SignerKey) -> StoreResult<Option<SignerRecord>>;

    /// Register a signer as active (admin/bootstrap path). Re-registering an
    /// existing key updates only the policy blob; a revoked signer stays
    /// revoked.
    async fn upsert_signer(&self, key: &SignerKey, policy: Option<Value>) -> StoreResult<()>;

    /// Revoke a signer. Monotonic; returns whether a row changed.
    async fn revoke_signer(&self, key: &SignerKey) -> StoreResult<bool>;
}

/// The append-only audit log.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Append one event. Events are never mutated.
    async fn append_audit(&self, event: NewAuditEvent) -> StoreResult<()>;

    /// Events for one resource, oldest first.
    async fn audit_for_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> StoreResult<Vec<AuditEvent>>;
}

/// The full storage surface, implemented by each backend.
pub trait Store: JobStore + UtxoPool + SignerRegistry + AuditLog {}

impl<T: JobStore + UtxoPool + SignerRegistry + AuditLog> Store for T {}
