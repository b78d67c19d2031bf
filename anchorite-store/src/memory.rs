//! In-memory store for tests and local development.
//!
//! Implements the full storage surface behind one mutex, which gives it the
//! same atomicity guarantees the Postgres backend gets from transactions and
//! row locks: every trait method is a single critical section. Concurrency
//! properties (no double-claims, no double-reservations) therefore hold for
//! any number of tokio tasks sharing one instance.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use anchorite_core::SignerKey;

use crate::error::{StoreError, StoreResult};
use crate::traits::{AuditLog, JobStore, SignerRegistry, UtxoPool};
use crate::types::{
    AdmitRequest, Admitted, AuditEvent, BatchId, JobId, JobStatus, NewAuditEvent, NewUtxo,
    PoolStats, PublishJob, ReservedUtxo, SignerRecord, SignerStatus, TransitionFields, Utxo,
    UtxoPurpose, UtxoStatus,
};

#[derive(Default)]
struct Inner {
    jobs: BTreeMap<i64, PublishJob>,
    nonces: HashSet<(String, String)>,
    utxos: BTreeMap<i64, Utxo>,
    signers: HashMap<String, SignerRecord>,
    audit: Vec<AuditEvent>,
    next_job_id: i64,
    next_utxo_id: i64,
    next_audit_id: i64,
}

impl Inner {
    fn append_audit_locked(&mut self, event: NewAuditEvent, now: DateTime<Utc>) {
        self.next_audit_id += 1;
        self.audit.push(AuditEvent {
            id: self.next_audit_id,
            event_type: event.event_type,
            actor: event.actor,
            resource_type: event.resource_type,
            resource_id: event.resource_id,
            action: event.action,
            details: event.details,
            created_at: now,
        });
    }

    fn sweep_expired_leases(&mut self, now: DateTime<Utc>) {
        for utxo in self.utxos.values_mut() {
            if utxo.status == UtxoStatus::Reserved
                && utxo.reserved_until.map(|t| t < now).unwrap_or(false)
            {
                utxo.status = UtxoStatus::Available;
                utxo.reserved_at = None;
                utxo.reserved_until = None;
            }
        }
    }
}

/// The in-memory backend.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count jobs currently in `status` (test helper).
    pub fn count_with_status(&self, status: JobStatus) -> usize {
        self.inner
            .lock()
            .jobs
            .values()
            .filter(|j| j.status == status)
            .count()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn admit(&self, req: AdmitRequest) -> StoreResult<Admitted> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        if !inner
            .nonces
            .insert((req.signer.to_hex(), req.nonce.clone()))
        {
            return Err(StoreError::Replay);
        }

        if let Some(existing) = inner
            .jobs
            .values()
            .find(|j| j.record_hash == req.record_hash)
        {
            let job_id = existing.job_id.clone();
            let actor = req.signer;
            inner.append_audit_locked(
                NewAuditEvent::job("submit", &job_id, Some(actor)),
                now,
            );
            return Ok(Admitted {
                job_id,
                duplicate: true,
            });
        }

        inner.next_job_id += 1;
        let id = inner.next_job_id;
        let job_id = JobId::generate();
        let job = PublishJob {
            id,
            job_id: job_id.clone(),
            record_id: req.record_id,
            canonical_body: req.canonical_body,
            record_hash: req.record_hash,
            signer: req.signer,
            status: JobStatus::Queued,
            ledger_txid: None,
            error_code: None,
            error_detail: None,
            batch_id: None,
            batch_seq: None,
            sending_started_at: None,
            created_at: now,
            sent_at: None,
            updated_at: now,
        };
        inner.jobs.insert(id, job);
        inner.append_audit_locked(NewAuditEvent::job("submit", &job_id, Some(req.signer)), now);

        Ok(Admitted {
            job_id,
            duplicate: false,
        })
    }

    async fn nonce_seen(&self, signer: &SignerKey, nonce: &str) -> StoreResult<bool> {
        let inner = self.inner.lock();
        Ok(inner
            .nonces
            .contains(&(signer.to_hex(), nonce.to_string())))
    }

    async fn transition(
        &self,
        job_id: &JobId,
        from: JobStatus,
        to: JobStatus,
        fields: TransitionFields,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        let Some(job) = inner
            .jobs
            .values_mut()
            .find(|j| &j.job_id == job_id && j.status == from)
        else {
            return Ok(false);
        };

        job.status = to;
        if let Some(txid) = fields.ledger_txid {
            job.ledger_txid = Some(txid);
        }
        if let Some(code) = fields.error_code {
            job.error_code = Some(code);
        }
        if let Some(detail) = fields.error_detail {
            job.error_detail = Some(detail);
        }
        if to == JobStatus::Sent {
            job.sent_at = Some(now);
        }
        job.updated_at = now;
        Ok(true)
    }

    async fn claim_oldest_queued(&self) -> StoreResult<Option<PublishJob>> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        let picked = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        let Some(id) = picked else {
            return Ok(None);
        };

        let job = inner.jobs.get_mut(&id).expect("picked job exists");
        job.status = JobStatus::Processing;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn claim_queued(&self, limit: u32) -> StoreResult<Vec<PublishJob>> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        let mut keys: Vec<(DateTime<Utc>, i64)> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .map(|j| (j.created_at, j.id))
            .collect();
        keys.sort_unstable();
        let picked: Vec<i64> = keys
            .into_iter()
            .take(limit as usize)
            .map(|(_, id)| id)
            .collect();

        if picked.is_empty() {
            return Ok(Vec::new());
        }

        let batch_id = BatchId::generate();
        let mut claimed = Vec::with_capacity(picked.len());
        for (seq, id) in picked.into_iter().enumerate() {
            let job = inner.jobs.get_mut(&id).expect("picked job exists");
            job.status = JobStatus::ProcessingBatch;
            job.batch_id = Some(batch_id.clone());
            job.batch_seq = Some(seq as i32 + 1);
            job.updated_at = now;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn claim_next_in_batch(&self, batch_id: &BatchId) -> StoreResult<Option<PublishJob>> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        let picked = inner
            .jobs
            .values()
            .filter(|j| {
                j.batch_id.as_ref() == Some(batch_id) && j.status == JobStatus::ProcessingBatch
            })
            .min_by_key(|j| j.batch_seq)
            .map(|j| j.id);

        let Some(id) = picked else {
            return Ok(None);
        };

        let job = inner.jobs.get_mut(&id).expect("picked job exists");
        job.status = JobStatus::Sending;
        job.sending_started_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn unstick(&self, ttl: Duration) -> StoreResult<u64> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());

        let mut reverted = 0;
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Sending
                && job.sending_started_at.map(|t| t < cutoff).unwrap_or(false)
            {
                job.status = JobStatus::ProcessingBatch;
                job.sending_started_at = None;
                job.updated_at = now;
                reverted += 1;
            }
        }
        Ok(reverted)
    }

    async fn oldest_active_batch(&self) -> StoreResult<Option<BatchId>> {
        let inner = self.inner.lock();

        let mut oldest_per_batch: HashMap<&BatchId, DateTime<Utc>> = HashMap::new();
        for job in inner.jobs.values() {
            if matches!(job.status, JobStatus::ProcessingBatch | JobStatus::Sending) {
                if let Some(batch_id) = &job.batch_id {
                    let entry = oldest_per_batch
                        .entry(batch_id)
                        .or_insert(job.created_at);
                    if job.created_at < *entry {
                        *entry = job.created_at;
                    }
                }
            }
        }

        Ok(oldest_per_batch
            .into_iter()
            .min_by_key(|(_, created)| *created)
            .map(|(batch_id, _)| batch_id.clone()))
    }

    async fn job(&self, job_id: &JobId) -> StoreResult<Option<PublishJob>> {
        let inner = self.inner.lock();
        Ok(inner
            .jobs
            .values()
            .find(|j| &j.job_id == job_id)
            .cloned())
    }

    async fn latest_job_for_record(&self, record_id: &str) -> StoreResult<Option<PublishJob>> {
        let inner = self.inner.lock();
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.record_id == record_id)
            .max_by_key(|j| (j.created_at, j.id))
            .cloned())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl UtxoPool for MemoryStore {
    async fn reserve(&self, lease: Duration) -> StoreResult<Option<ReservedUtxo>> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        inner.sweep_expired_leases(now);

        let picked = inner
            .utxos
            .values()
            .filter(|u| {
                u.purpose == UtxoPurpose::Publish && u.status == UtxoStatus::Available && !u.dirty
            })
            .min_by_key(|u| (u.satoshis, u.created_at, u.id))
            .map(|u| u.id);

        let Some(id) = picked else {
            return Ok(None);
        };

        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero());
        let utxo = inner.utxos.get_mut(&id).expect("picked utxo exists");
        utxo.status = UtxoStatus::Reserved;
        utxo.reserved_at = Some(now);
        utxo.reserved_until = Some(now + lease);

        Ok(Some(ReservedUtxo {
            id: utxo.id,
            txid: utxo.txid.clone(),
            vout: utxo.vout,
            satoshis: utxo.satoshis,
            script_pubkey: utxo.script_pubkey.clone(),
        }))
    }

    async fn mark_spent(&self, utxo_id: i64, ledger_txid: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        let Some(utxo) = inner.utxos.get_mut(&utxo_id) else {
            return Err(StoreError::NotFound(format!("utxo {utxo_id}")));
        };

        let was_reserved = utxo.status == UtxoStatus::Reserved;
        utxo.status = UtxoStatus::Spent;
        utxo.spent_at = Some(now);
        utxo.spent_by_txid = Some(ledger_txid.to_string());
        utxo.reserved_at = None;
        utxo.reserved_until = None;
        Ok(was_reserved)
    }

    async fn release(&self, utxo_id: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if let Some(utxo) = inner.utxos.get_mut(&utxo_id) {
            if utxo.status == UtxoStatus::Reserved {
                utxo.status = UtxoStatus::Available;
                utxo.reserved_at = None;
                utxo.reserved_until = None;
            }
        }
        Ok(())
    }

    async fn mark_dirty(&self, utxo_id: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if let Some(utxo) = inner.utxos.get_mut(&utxo_id) {
            if utxo.status != UtxoStatus::Spent {
                utxo.dirty = true;
                utxo.status = UtxoStatus::Available;
                utxo.reserved_at = None;
                utxo.reserved_until = None;
            }
        }
        Ok(())
    }

    async fn insert_utxos(&self, rows: &[NewUtxo]) -> StoreResult<u64> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let mut inserted = 0;

        for row in rows {
            let exists = inner
                .utxos
                .values()
                .any(|u| u.txid == row.txid && u.vout == row.vout);
            if exists {
                continue;
            }
            inner.next_utxo_id += 1;
            let id = inner.next_utxo_id;
            inner.utxos.insert(
                id,
                Utxo {
                    id,
                    txid: row.txid.clone(),
                    vout: row.vout,
                    satoshis: row.satoshis,
                    script_pubkey: row.script_pubkey.clone(),
                    address: row.address.clone(),
                    purpose: row.purpose,
                    status: UtxoStatus::Available,
                    reserved_at: None,
                    reserved_until: None,
                    dirty: false,
                    spent_at: None,
                    spent_by_txid: None,
                    created_at: now,
                },
            );
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn pool_stats(&self, unit_value: u64) -> StoreResult<PoolStats> {
        let inner = self.inner.lock();
        let mut stats = PoolStats {
            unit_available: 0,
            publish_available: 0,
            reserved: 0,
            spent: 0,
            dirty: 0,
        };

        for utxo in inner.utxos.values() {
            if utxo.dirty {
                stats.dirty += 1;
            }
            match utxo.status {
                UtxoStatus::Available => {
                    if utxo.purpose == UtxoPurpose::Publish {
                        stats.publish_available += 1;
                        if !utxo.dirty && utxo.satoshis == unit_value {
                            stats.unit_available += 1;
                        }
                    }
                }
                UtxoStatus::Reserved => stats.reserved += 1,
                UtxoStatus::Spent => stats.spent += 1,
            }
        }
        Ok(stats)
    }

    async fn largest_source(&self) -> StoreResult<Option<Utxo>> {
        let inner = self.inner.lock();
        Ok(inner
            .utxos
            .values()
            .filter(|u| {
                matches!(u.purpose, UtxoPurpose::Funding | UtxoPurpose::Change)
                    && u.status == UtxoStatus::Available
                    && !u.dirty
            })
            .max_by_key(|u| u.satoshis)
            .cloned())
    }

    async fn utxo(&self, utxo_id: i64) -> StoreResult<Option<Utxo>> {
        let inner = self.inner.lock();
        Ok(inner.utxos.get(&utxo_id).cloned())
    }
}

#[async_trait]
impl SignerRegistry for MemoryStore {
    async fn signer(&self, key: &SignerKey) -> StoreResult<Option<SignerRecord>> {
        let inner = self.inner.lock();
        Ok(inner.signers.get(&key.to_hex()).cloned())
    }

    async fn upsert_signer(&self, key: &SignerKey, policy: Option<Value>) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        inner
            .signers
            .entry(key.to_hex())
            .and_modify(|record| record.policy = policy.clone())
            .or_insert_with(|| SignerRecord {
                pubkey: *key,
                status: SignerStatus::Active,
                policy,
                created_at: now,
            });
        Ok(())
    }

    async fn revoke_signer(&self, key: &SignerKey) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.signers.get_mut(&key.to_hex()) {
            if record.status == SignerStatus::Active {
                record.status = SignerStatus::Revoked;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl AuditLog for MemoryStore {
    async fn append_audit(&self, event: NewAuditEvent) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        inner.append_audit_locked(event, now);
        Ok(())
    }

    async fn audit_for_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> StoreResult<Vec<AuditEvent>> {
        let inner = self.inner.lock();
        Ok(inner
            .audit
            .iter()
            .filter(|e| e.resource_type == resource_type && e.resource_id == resource_id)
            .cloned()
            .collect())
    }
}
