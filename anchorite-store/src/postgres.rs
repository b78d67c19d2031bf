//! Postgres backend.
//!
//! A thin set of adapters over one `PgPool`. All SQL is runtime-checked
//! (`sqlx::query`, not the compile-time macros) so the workspace builds
//! without a live database. Atomicity strategy:
//!
//! - `admit` runs nonce insert, job insert, and the audit append in one
//!   transaction; uniqueness violations are detected via
//!   `ON CONFLICT DO NOTHING` + affected-row counts, never by string-matching
//!   errors.
//! - Claims (`claim_oldest_queued`, `claim_queued`, `claim_next_in_batch`,
//!   `reserve`) are CTE + `FOR UPDATE SKIP LOCKED` updates, so concurrent
//!   workers across processes never block each other and never double-claim.
//! - Status writes are conditional (`WHERE status = $from`), making the state
//!   machine race-free without any in-process coordination.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

use anchorite_core::{RecordHash, SignerKey};

use crate::error::{StoreError, StoreResult};
use crate::traits::{AuditLog, JobStore, SignerRegistry, UtxoPool};
use crate::types::{
    AdmitRequest, Admitted, AuditEvent, BatchId, JobId, JobStatus, NewAuditEvent, NewUtxo,
    PoolStats, PublishJob, ReservedUtxo, SignerRecord, SignerStatus, TransitionFields, Utxo,
    UtxoPurpose, UtxoStatus,
};

const JOB_COLUMNS: &str = "id, job_id, record_id, canonical_body, record_hash, signer_pubkey, \
     status, ledger_txid, error_code, error_detail, batch_id, batch_seq, sending_started_at, \
     created_at, sent_at, updated_at";

const JOB_COLUMNS_J: &str = "j.id, j.job_id, j.record_id, j.canonical_body, j.record_hash, \
     j.signer_pubkey, j.status, j.ledger_txid, j.error_code, j.error_detail, j.batch_id, \
     j.batch_seq, j.sending_started_at, j.created_at, j.sent_at, j.updated_at";

const UTXO_COLUMNS: &str = "id, txid, vout, satoshis, script_pubkey, address, purpose, status, \
     reserved_at, reserved_until, dirty, spent_at, spent_by_txid, created_at";

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with a bounded pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Apply the embedded migrations.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct PgJobRow {
    id: i64,
    job_id: String,
    record_id: String,
    canonical_body: String,
    record_hash: String,
    signer_pubkey: String,
    status: String,
    ledger_txid: Option<String>,
    error_code: Option<String>,
    error_detail: Option<String>,
    batch_id: Option<String>,
    batch_seq: Option<i32>,
    sending_started_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl PgJobRow {
    fn into_job(self) -> StoreResult<PublishJob> {
        Ok(PublishJob {
            id: self.id,
            job_id: JobId(self.job_id),
            record_id: self.record_id,
            canonical_body: self.canonical_body,
            record_hash: RecordHash::from_hex(&self.record_hash)
                .map_err(|e| StoreError::Backend(format!("corrupt record_hash: {e}")))?,
            signer: SignerKey::from_hex(&self.signer_pubkey)
                .map_err(|e| StoreError::Backend(format!("corrupt signer_pubkey: {e}")))?,
            status: JobStatus::parse(&self.status)
                .ok_or_else(|| StoreError::Backend(format!("corrupt status: {}", self.status)))?,
            ledger_txid: self.ledger_txid,
            error_code: self.error_code,
            error_detail: self.error_detail,
            batch_id: self.batch_id.map(BatchId),
            batch_seq: self.batch_seq,
            sending_started_at: self.sending_started_at,
            created_at: self.created_at,
            sent_at: self.sent_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PgUtxoRow {
    id: i64,
    txid: String,
    vout: i32,
    satoshis: i64,
    script_pubkey: String,
    address: String,
    purpose: String,
    status: String,
    reserved_at: Option<DateTime<Utc>>,
    reserved_until: Option<DateTime<Utc>>,
    dirty: bool,
    spent_at: Option<DateTime<Utc>>,
    spent_by_txid: Option<String>,
    created_at: DateTime<Utc>,
}

impl PgUtxoRow {
    fn into_utxo(self) -> StoreResult<Utxo> {
        Ok(Utxo {
            id: self.id,
            txid: self.txid,
            vout: self.vout as u32,
            satoshis: self.satoshis as u64,
            script_pubkey: self.script_pubkey,
            address: self.address,
            purpose: UtxoPurpose::parse(&self.purpose)
                .ok_or_else(|| StoreError::Backend(format!("corrupt purpose: {}", self.purpose)))?,
            status: UtxoStatus::parse(&self.status)
                .ok_or_else(|| StoreError::Backend(format!("corrupt status: {}", self.status)))?,
            reserved_at: self.reserved_at,
            reserved_until: self.reserved_until,
            dirty: self.dirty,
            spent_at: self.spent_at,
            spent_by_txid: self.spent_by_txid,
            created_at: self.created_at,
        })
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn admit(&self, req: AdmitRequest) -> StoreResult<Admitted> {
        let mut tx = self.pool.begin().await?;

        let nonce_insert = sqlx::query(
            "INSERT INTO nonces (pubkey, nonce) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(req.signer.to_hex())
        .bind(&req.nonce)
        .execute(&mut *tx)
        .await?;

        if nonce_insert.rows_affected() == 0 {
            return Err(StoreError::Replay);
        }

        let fresh_id = JobId::generate();
        let inserted: Option<(String,)> = sqlx::query_as(
            "INSERT INTO publish_jobs (job_id, record_id, canonical_body, record_hash, signer_pubkey) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (record_hash) DO NOTHING \
             RETURNING job_id",
        )
        .bind(fresh_id.as_str())
        .bind(&req.record_id)
        .bind(&req.canonical_body)
        .bind(req.record_hash.to_hex())
        .bind(req.signer.to_hex())
        .fetch_optional(&mut *tx)
        .await?;

        let (job_id, duplicate) = match inserted {
            Some((id,)) => (JobId(id), false),
            None => {
                let (existing,): (String,) =
                    sqlx::query_as("SELECT job_id FROM publish_jobs WHERE record_hash = $1")
                        .bind(req.record_hash.to_hex())
                        .fetch_one(&mut *tx)
                        .await?;
                (JobId(existing), true)
            }
        };

        sqlx::query(
            "INSERT INTO audit_events (event_type, actor_pubkey, resource_type, resource_id, action, details) \
             VALUES ('PUBLISH_INTENT', $1, 'job', $2, 'submit', $3)",
        )
        .bind(req.signer.to_hex())
        .bind(job_id.as_str())
        .bind(serde_json::json!({
            "recordId": req.record_id,
            "hash": req.record_hash.to_hex(),
            "duplicate": duplicate,
        }))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Admitted { job_id, duplicate })
    }

    async fn nonce_seen(&self, signer: &SignerKey, nonce: &str) -> StoreResult<bool> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM nonces WHERE pubkey = $1 AND nonce = $2")
                .bind(signer.to_hex())
                .bind(nonce)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn transition(
        &self,
        job_id: &JobId,
        from: JobStatus,
        to: JobStatus,
        fields: TransitionFields,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE publish_jobs \
             SET status = $3, \
                 ledger_txid = COALESCE($4, ledger_txid), \
                 error_code = COALESCE($5, error_code), \
                 error_detail = COALESCE($6, error_detail), \
                 sent_at = CASE WHEN $3 = 'sent' THEN now() ELSE sent_at END, \
                 updated_at = now() \
             WHERE job_id = $1 AND status = $2",
        )
        .bind(job_id.as_str())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(fields.ledger_txid)
        .bind(fields.error_code)
        .bind(fields.error_detail)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_oldest_queued(&self) -> StoreResult<Option<PublishJob>> {
        let row: Option<PgJobRow> = sqlx::query_as(&format!(
            "WITH picked AS ( \
                 SELECT id FROM publish_jobs \
                 WHERE status = 'queued' \
                 ORDER BY created_at, id \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE publish_jobs j \
             SET status = 'processing', updated_at = now() \
             FROM picked \
             WHERE j.id = picked.id \
             RETURNING {JOB_COLUMNS_J}"
        ))
        .fetch_optional(&self.pool)
        .await?;

        row.map(PgJobRow::into_job).transpose()
    }

    async fn claim_queued(&self, limit: u32) -> StoreResult<Vec<PublishJob>> {
        let batch_id = BatchId::generate();

        let rows: Vec<PgJobRow> = sqlx::query_as(&format!(
            "WITH picked AS ( \
                 SELECT id, created_at FROM publish_jobs \
                 WHERE status = 'queued' \
                 ORDER BY created_at, id \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED \
             ), numbered AS ( \
                 SELECT id, row_number() OVER (ORDER BY created_at, id) AS seq \
                 FROM picked \
             ) \
             UPDATE publish_jobs j \
             SET status = 'processing_batch', \
                 batch_id = $1, \
                 batch_seq = numbered.seq, \
                 updated_at = now() \
             FROM numbered \
             WHERE j.id = numbered.id \
             RETURNING {JOB_COLUMNS_J}"
        ))
        .bind(batch_id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = rows
            .into_iter()
            .map(PgJobRow::into_job)
            .collect::<StoreResult<Vec<_>>>()?;
        jobs.sort_by_key(|j| j.batch_seq);
        Ok(jobs)
    }

    async fn claim_next_in_batch(&self, batch_id: &BatchId) -> StoreResult<Option<PublishJob>> {
        let row: Option<PgJobRow> = sqlx::query_as(&format!(
            "WITH next AS ( \
                 SELECT id FROM publish_jobs \
                 WHERE batch_id = $1 AND status = 'processing_batch' \
                 ORDER BY batch_seq \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE publish_jobs j \
             SET status = 'sending', sending_started_at = now(), updated_at = now() \
             FROM next \
             WHERE j.id = next.id \
             RETURNING {JOB_COLUMNS_J}"
        ))
        .bind(batch_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(PgJobRow::into_job).transpose()
    }

    async fn unstick(&self, ttl: Duration) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE publish_jobs \
             SET status = 'processing_batch', sending_started_at = NULL, updated_at = now() \
             WHERE status = 'sending' \
               AND sending_started_at < now() - make_interval(secs => $1)",
        )
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn oldest_active_batch(&self) -> StoreResult<Option<BatchId>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT batch_id FROM publish_jobs \
             WHERE status IN ('processing_batch', 'sending') AND batch_id IS NOT NULL \
             GROUP BY batch_id \
             ORDER BY MIN(created_at) \
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| BatchId(id)))
    }

    async fn job(&self, job_id: &JobId) -> StoreResult<Option<PublishJob>> {
        let row: Option<PgJobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM publish_jobs WHERE job_id = $1"
        ))
        .bind(job_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(PgJobRow::into_job).transpose()
    }

    async fn latest_job_for_record(&self, record_id: &str) -> StoreResult<Option<PublishJob>> {
        let row: Option<PgJobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM publish_jobs \
             WHERE record_id = $1 \
             ORDER BY created_at DESC, id DESC \
             LIMIT 1"
        ))
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PgJobRow::into_job).transpose()
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl UtxoPool for PgStore {
    async fn reserve(&self, lease: Duration) -> StoreResult<Option<ReservedUtxo>> {
        let mut tx = self.pool.begin().await?;

        // Sweep expired leases first so a crashed worker cannot starve the
        // pool; merged here instead of a separate sweeper task.
        sqlx::query(
            "UPDATE utxos \
             SET status = 'available', reserved_at = NULL, reserved_until = NULL \
             WHERE status = 'reserved' AND reserved_until < now()",
        )
        .execute(&mut *tx)
        .await?;

        let row: Option<(i64, String, i32, i64, String)> = sqlx::query_as(
            "WITH candidate AS ( \
                 SELECT id FROM utxos \
                 WHERE purpose = 'publish' AND status = 'available' AND dirty = FALSE \
                 ORDER BY satoshis, created_at \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE utxos u \
             SET status = 'reserved', \
                 reserved_at = now(), \
                 reserved_until = now() + make_interval(secs => $1) \
             FROM candidate \
             WHERE u.id = candidate.id \
             RETURNING u.id, u.txid, u.vout, u.satoshis, u.script_pubkey",
        )
        .bind(lease.as_secs_f64())
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(row.map(|(id, txid, vout, satoshis, script_pubkey)| ReservedUtxo {
            id,
            txid,
            vout: vout as u32,
            satoshis: satoshis as u64,
            script_pubkey,
        }))
    }

    async fn mark_spent(&self, utxo_id: i64, ledger_txid: &str) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let prev: Option<(String,)> =
            sqlx::query_as("SELECT status FROM utxos WHERE id = $1 FOR UPDATE")
                .bind(utxo_id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((prev_status,)) = prev else {
            return Err(StoreError::NotFound(format!("utxo {utxo_id}")));
        };

        sqlx::query(
            "UPDATE utxos \
             SET status = 'spent', spent_at = now(), spent_by_txid = $2, \
                 reserved_at = NULL, reserved_until = NULL \
             WHERE id = $1",
        )
        .bind(utxo_id)
        .bind(ledger_txid)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(prev_status == "reserved")
    }

    async fn release(&self, utxo_id: i64) -> StoreResult<()> {
        sqlx::query(
            "UPDATE utxos \
             SET status = 'available', reserved_at = NULL, reserved_until = NULL \
             WHERE id = $1 AND status = 'reserved'",
        )
        .bind(utxo_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_dirty(&self, utxo_id: i64) -> StoreResult<()> {
        sqlx::query(
            "UPDATE utxos \
             SET dirty = TRUE, status = 'available', reserved_at = NULL, reserved_until = NULL \
             WHERE id = $1 AND status <> 'spent'",
        )
        .bind(utxo_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_utxos(&self, rows: &[NewUtxo]) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for row in rows {
            let result = sqlx::query(
                "INSERT INTO utxos (txid, vout, satoshis, script_pubkey, address, purpose) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (txid, vout) DO NOTHING",
            )
            .bind(&row.txid)
            .bind(row.vout as i32)
            .bind(row.satoshis as i64)
            .bind(&row.script_pubkey)
            .bind(&row.address)
            .bind(row.purpose.as_str())
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn pool_stats(&self, unit_value: u64) -> StoreResult<PoolStats> {
        let row = sqlx::query(
            "SELECT \
                 COUNT(*) FILTER (WHERE purpose = 'publish' AND status = 'available' \
                                    AND dirty = FALSE AND satoshis = $1) AS unit_available, \
                 COUNT(*) FILTER (WHERE purpose = 'publish' AND status = 'available') AS publish_available, \
                 COUNT(*) FILTER (WHERE status = 'reserved') AS reserved, \
                 COUNT(*) FILTER (WHERE status = 'spent') AS spent, \
                 COUNT(*) FILTER (WHERE dirty) AS dirty \
             FROM utxos",
        )
        .bind(unit_value as i64)
        .fetch_one(&self.pool)
        .await?;

        Ok(PoolStats {
            unit_available: row.try_get::<i64, _>("unit_available")? as u64,
            publish_available: row.try_get::<i64, _>("publish_available")? as u64,
            reserved: row.try_get::<i64, _>("reserved")? as u64,
            spent: row.try_get::<i64, _>("spent")? as u64,
            dirty: row.try_get::<i64, _>("dirty")? as u64,
        })
    }

    async fn largest_source(&self) -> StoreResult<Option<Utxo>> {
        let row: Option<PgUtxoRow> = sqlx::query_as(&format!(
            "SELECT {UTXO_COLUMNS} FROM utxos \
             WHERE purpose IN ('funding', 'change') AND status = 'available' AND dirty = FALSE \
             ORDER BY satoshis DESC \
             LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;

        row.map(PgUtxoRow::into_utxo).transpose()
    }

    async fn utxo(&self, utxo_id: i64) -> StoreResult<Option<Utxo>> {
        let row: Option<PgUtxoRow> =
            sqlx::query_as(&format!("SELECT {UTXO_COLUMNS} FROM utxos WHERE id = $1"))
                .bind(utxo_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(PgUtxoRow::into_utxo).transpose()
    }
}

#[async_trait]
impl SignerRegistry for PgStore {
    async fn signer(&self, key: &SignerKey) -> StoreResult<Option<SignerRecord>> {
        let row: Option<(String, String, Option<Value>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT pubkey, status, policy, created_at FROM signers WHERE pubkey = $1",
        )
        .bind(key.to_hex())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(pubkey, status, policy, created_at)| {
            Ok(SignerRecord {
                pubkey: SignerKey::from_hex(&pubkey)
                    .map_err(|e| StoreError::Backend(format!("corrupt signer pubkey: {e}")))?,
                status: SignerStatus::parse(&status)
                    .ok_or_else(|| StoreError::Backend(format!("corrupt signer status: {status}")))?,
                policy,
                created_at,
            })
        })
        .transpose()
    }

    async fn upsert_signer(&self, key: &SignerKey, policy: Option<Value>) -> StoreResult<()> {
        // Revocation is monotonic: re-registering never reactivates a key.
        sqlx::query(
            "INSERT INTO signers (pubkey, status, policy) VALUES ($1, 'active', $2) \
             ON CONFLICT (pubkey) DO UPDATE SET policy = EXCLUDED.policy",
        )
        .bind(key.to_hex())
        .bind(policy)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke_signer(&self, key: &SignerKey) -> StoreResult<bool> {
        let result =
            sqlx::query("UPDATE signers SET status = 'revoked' WHERE pubkey = $1 AND status = 'active'")
                .bind(key.to_hex())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl AuditLog for PgStore {
    async fn append_audit(&self, event: NewAuditEvent) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO audit_events (event_type, actor_pubkey, resource_type, resource_id, action, details) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&event.event_type)
        .bind(event.actor.map(|k| k.to_hex()))
        .bind(&event.resource_type)
        .bind(&event.resource_id)
        .bind(&event.action)
        .bind(event.details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn audit_for_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> StoreResult<Vec<AuditEvent>> {
        let rows: Vec<(i64, String, Option<String>, String, String, String, Option<Value>, DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT id, event_type, actor_pubkey, resource_type, resource_id, action, details, created_at \
                 FROM audit_events \
                 WHERE resource_type = $1 AND resource_id = $2 \
                 ORDER BY id",
            )
            .bind(resource_type)
            .bind(resource_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(
                |(id, event_type, actor, resource_type, resource_id, action, details, created_at)| {
                    let actor = actor
                        .map(|a| {
                            SignerKey::from_hex(&a).map_err(|e| {
                                StoreError::Backend(format!("corrupt actor pubkey: {e}"))
                            })
                        })
                        .transpose()?;
                    Ok(AuditEvent {
                        id,
                        event_type,
                        actor,
                        resource_type,
                        resource_id,
                        action,
                        details,
                        created_at,
                    })
                },
            )
            .collect()
    }
}
