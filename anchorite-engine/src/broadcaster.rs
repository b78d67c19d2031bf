//! The batch broadcaster loop and the unstick sweeper.
//!
//! A single logical consumer drains the oldest active batch job-by-job in
//! ascending `batch_seq`, acquiring one token from the rate limiter before
//! every broadcast. A newer batch is not touched until the older one has
//! reached terminal states throughout. The companion sweeper reverts jobs
//! stuck in `sending` past the TTL back to `processing_batch`, which is the
//! crash-recovery edge: on restart the broadcaster simply resumes at the
//! lowest unfinished sequence number.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use anchorite_core::{ErrorKind, ServerKey};
use anchorite_ledger::{build_anchor_tx, Broadcaster, LedgerConfig};
use anchorite_store::{BatchId, JobStatus, PublishJob, Store, StoreResult};

use crate::config::EngineConfig;
use crate::ratelimit::TokenBucket;
use crate::worker::{fail_job, finish_broadcast, spendable};

/// Drains batches in order, metered by the token bucket.
pub struct BatchBroadcaster<S: ?Sized> {
    store: Arc<S>,
    broadcaster: Arc<dyn Broadcaster>,
    bucket: Arc<TokenBucket>,
    key: ServerKey,
    ledger: LedgerConfig,
    config: EngineConfig,
}

impl<S: Store + ?Sized> BatchBroadcaster<S> {
    /// Create a broadcaster. The bucket is passed in explicitly so tests
    /// (and an eventual shared limiter) can substitute their own.
    pub fn new(
        store: Arc<S>,
        broadcaster: Arc<dyn Broadcaster>,
        bucket: Arc<TokenBucket>,
        key: ServerKey,
        ledger: LedgerConfig,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            broadcaster,
            bucket,
            key,
            ledger,
            config,
        }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("batch broadcaster started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.drain_oldest_batch(&shutdown).await {
                Ok(Some(drained)) if drained > 0 => {
                    // Keep going; there may be another batch waiting.
                }
                Ok(_) => {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(self.config.idle_delay()) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "broadcaster iteration failed");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(self.config.idle_delay()) => {}
                    }
                }
            }
        }
        info!("batch broadcaster stopped");
    }

    /// Pick the oldest active batch and drain it in sequence order.
    ///
    /// Returns `None` when there is no active batch, otherwise how many jobs
    /// were driven to a terminal state in this pass.
    pub async fn drain_oldest_batch(
        &self,
        shutdown: &watch::Receiver<bool>,
    ) -> StoreResult<Option<usize>> {
        let Some(batch_id) = self.store.oldest_active_batch().await? else {
            return Ok(None);
        };

        let mut drained = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let Some(job) = self.store.claim_next_in_batch(&batch_id).await? else {
                break;
            };
            self.process_claimed(&job).await?;
            drained += 1;
        }

        if drained > 0 {
            info!(batch_id = %batch_id, drained, "batch pass complete");
        }
        Ok(Some(drained))
    }

    /// Process one job already claimed into `sending`.
    async fn process_claimed(&self, job: &PublishJob) -> StoreResult<()> {
        let Some(utxo) = self.store.reserve(self.config.utxo_lease()).await? else {
            warn!(job_id = %job.job_id, "no publish UTXO available");
            return fail_job(
                &*self.store,
                job,
                JobStatus::Sending,
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
                    JobStatus::Sending,
                    ErrorKind::BuildError,
                    e.to_string(),
                )
                .await;
            }
        };

        // The only throttling point in the pipeline.
        self.bucket.take(1).await;

        let outcome = self.broadcaster.broadcast(&built.raw_hex).await;
        finish_broadcast(&*self.store, job, JobStatus::Sending, &utxo, outcome).await?;
        Ok(())
    }
}

/// Reverts jobs stuck in `sending` past the TTL.
pub struct UnstickSweeper<S: ?Sized> {
    store: Arc<S>,
    config: EngineConfig,
}

impl<S: Store + ?Sized> UnstickSweeper<S> {
    /// Create a sweeper.
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// One sweep; returns how many jobs were reverted.
    pub async fn sweep_once(&self) -> StoreResult<u64> {
        let reverted = self.store.unstick(self.config.sending_ttl()).await?;
        if reverted > 0 {
            warn!(reverted, "reverted stale sending jobs to processing_batch");
        }
        Ok(reverted)
    }

    /// Run until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.unstick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "unstick sweep failed");
                    }
                }
            }
        }
    }
}
