//! The batch collector loop.
//!
//! Every `batch_window_ms` it claims up to `max_batch_size` queued jobs into
//! a fresh batch. Sequence numbers are assigned by the store in creation
//! order and are immutable from then on; the broadcaster honors them
//! downstream. Multiple collectors can run concurrently, the skip-locked
//! claim keeps them from double-claiming.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info};

use anchorite_store::{JobStore, StoreResult};

use crate::config::EngineConfig;

/// Periodically forms batches out of the queued backlog.
pub struct BatchCollector<S: ?Sized> {
    store: Arc<S>,
    config: EngineConfig,
}

impl<S: JobStore + ?Sized> BatchCollector<S> {
    /// Create a collector.
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(window_ms = self.config.batch_window_ms, "batch collector started");
        let mut ticker = tokio::time::interval(self.config.batch_window());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.collect_once().await {
                        error!(error = %e, "batch collection failed");
                    }
                }
            }
        }
        info!("batch collector stopped");
    }

    /// Claim one batch. Returns how many jobs were claimed.
    pub async fn collect_once(&self) -> StoreResult<usize> {
        let claimed = self.store.claim_queued(self.config.max_batch_size).await?;

        if claimed.is_empty() {
            debug!("queue empty; no batch formed");
            return Ok(0);
        }

        let batch_id = claimed[0]
            .batch_id
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();
        info!(batch_id = %batch_id, size = claimed.len(), "batch formed");
        Ok(claimed.len())
    }
}
