//! The single-job worker.
//!
//! Pulls one queued job at a time: claim → reserve → build → broadcast →
//! commit. Suitable for low-volume deployments; the batched path in
//! [`crate::collector`] / [`crate::broadcaster`] shares the same outcome
//! handling via [`finish_broadcast`].

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use anchorite_core::{ErrorKind, ServerKey};
use anchorite_ledger::{
    build_anchor_tx, BroadcastOutcome, Broadcaster, LedgerConfig, SpendableInput,
};
use anchorite_store::{
    JobId, JobStatus, NewAuditEvent, PublishJob, ReservedUtxo, Store, StoreResult,
    TransitionFields,
};

use crate::config::EngineConfig;
use crate::error::EngineResult;

pub(crate) fn spendable(utxo: &ReservedUtxo) -> SpendableInput {
    SpendableInput {
        txid: utxo.txid.clone(),
        vout: utxo.vout,
        satoshis: utxo.satoshis,
        script_pubkey: utxo.script_pubkey.clone(),
    }
}

/// Record a job failure: transition plus audit.
pub(crate) async fn fail_job<S: Store + ?Sized>(
    store: &S,
    job: &PublishJob,
    from: JobStatus,
    kind: ErrorKind,
    detail: String,
) -> StoreResult<()> {
    let applied = store
        .transition(
            &job.job_id,
            from,
            JobStatus::Failed,
            TransitionFields::failed(kind.as_str(), detail.clone()),
        )
        .await?;
    if !applied {
        warn!(job_id = %job.job_id, %from, "failure transition did not apply; job state moved underneath us");
        return Ok(());
    }

    store
        .append_audit(
            NewAuditEvent::job("broadcast_failed", &job.job_id, Some(job.signer))
                .with_details(serde_json::json!({ "errorCode": kind.as_str(), "detail": detail })),
        )
        .await
}

/// Apply the outcome of one broadcast attempt to the job and its UTXO.
///
/// The branches are identical for the single-job and batched paths; only
/// the from-state differs (`processing` vs `sending`).
pub(crate) async fn finish_broadcast<S: Store + ?Sized>(
    store: &S,
    job: &PublishJob,
    from: JobStatus,
    utxo: &ReservedUtxo,
    outcome: BroadcastOutcome,
) -> StoreResult<JobStatus> {
    match outcome {
        BroadcastOutcome::Success(ledger_txid) => {
            let was_reserved = store.mark_spent(utxo.id, &ledger_txid).await?;
            if !was_reserved {
                // The lease expired mid-broadcast and the sweeper took the
                // row back; the spend is still real, so record it and shout.
                warn!(
                    utxo_id = utxo.id,
                    %ledger_txid,
                    "marked a non-reserved UTXO spent; lease expired during broadcast"
                );
            }

            let applied = store
                .transition(
                    &job.job_id,
                    from,
                    JobStatus::Sent,
                    TransitionFields::sent(ledger_txid.clone()),
                )
                .await?;
            if !applied {
                warn!(job_id = %job.job_id, %from, "sent transition did not apply");
            }

            store
                .append_audit(
                    NewAuditEvent::job("broadcast", &job.job_id, Some(job.signer))
                        .with_details(serde_json::json!({ "txid": ledger_txid })),
                )
                .await?;
            info!(job_id = %job.job_id, "job sent");
            Ok(JobStatus::Sent)
        }
        BroadcastOutcome::MempoolConflict(detail) => {
            store.mark_dirty(utxo.id).await?;
            fail_job(store, job, from, ErrorKind::MempoolConflict, detail).await?;
            Ok(JobStatus::Failed)
        }
        BroadcastOutcome::TransientNetwork(detail) => {
            store.release(utxo.id).await?;
            fail_job(store, job, from, ErrorKind::TransientNetwork, detail).await?;
            Ok(JobStatus::Failed)
        }
        BroadcastOutcome::PermanentReject(detail) => {
            store.release(utxo.id).await?;
            fail_job(store, job, from, ErrorKind::PermanentReject, detail).await?;
            Ok(JobStatus::Failed)
        }
    }
}

/// The single-job worker loop.
pub struct JobWorker<S: ?Sized> {
    store: Arc<S>,
    broadcaster: Arc<dyn Broadcaster>,
    key: ServerKey,
    ledger: LedgerConfig,
    config: EngineConfig,
}

impl<S: Store + ?Sized> JobWorker<S> {
    /// Create a worker.
    pub fn new(
        store: Arc<S>,
        broadcaster: Arc<dyn Broadcaster>,
        key: ServerKey,
        ledger: LedgerConfig,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            broadcaster,
            key,
            ledger,
            config,
        }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("job worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.process_one().await {
                Ok(Some(job_id)) => {
                    info!(%job_id, "processed job");
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(self.config.idle_delay()) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "worker iteration failed");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(self.config.idle_delay()) => {}
                    }
                }
            }
        }
        info!("job worker stopped");
    }

    /// Claim and process the oldest queued job, if any.
    pub async fn process_one(&self) -> EngineResult<Option<JobId>> {
        let Some(job) = self.store.claim_oldest_queued().await? else {
            return Ok(None);
        };
        self.process(&job).await?;
        Ok(Some(job.job_id))
    }

    /// Process one job already claimed into `processing`.
    async fn process(&self, job: &PublishJob) -> StoreResult<()> {
        let Some(utxo) = self.store.reserve(self.config.utxo_lease()).await? else {
            // Nothing was reserved, so nothing to release.
            warn!(job_id = %job.job_id, "no publish UTXO available");
            return fail_job(
                &*self.store,
                job,
                JobStatus::Processing,
                ErrorKind::NoCapacity,
                "no publish UTXO available".into(),
            )
            .await;
        };

        let built = match build_anchor_tx(
            &spendable(&utxo),
            &job.record_hash,
            &self.ledger.change_address,
            &self.key,
            self.ledger.fee_rate_sats_per_kb,
            self.ledger.network,
        ) {
            Ok(built) => built,
            Err(e) => {
                self.store.release(utxo.id).await?;
                return fail_job(
                    &*self.store,
                    job,
                    JobStatus::Processing,
                    ErrorKind::BuildError,
                    e.to_string(),
                )
                .await;
            }
        };

        let outcome = self.broadcaster.broadcast(&built.raw_hex).await;
        finish_broadcast(&*self.store, job, JobStatus::Processing, &utxo, outcome).await?;
        Ok(())
    }
}
