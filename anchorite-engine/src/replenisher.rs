//! The pool replenisher.
//!
//! A slow-cadence monitor that keeps the publish pool deep enough to absorb
//! broadcast bursts. When the count of clean unit-value inputs drops below
//! the floor, it splits the largest available funding/change input into a
//! fan of fresh unit outputs plus change, broadcasts the split, and inserts
//! the new rows. A cooldown prevents thrash while many inputs are merely
//! reserved, not gone.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use anchorite_core::ServerKey;
use anchorite_ledger::{
    build_split_tx, BroadcastOutcome, Broadcaster, LedgerConfig, SpendableInput, SplitPlan,
};
use anchorite_store::{NewUtxo, Store, Utxo, UtxoPurpose};

use crate::config::EngineConfig;
use crate::error::EngineResult;

/// What one replenisher check decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplenishAction {
    /// Pool depth is fine.
    Idle,
    /// Depth is low but the cooldown has not elapsed.
    Cooldown,
    /// A split was broadcast; `minted` new publish inputs were inserted.
    Split {
        /// Transaction id of the split.
        txid: String,
        /// How many unit inputs were minted.
        minted: u32,
    },
    /// Depth is low and no sufficiently large source input exists.
    Alarm,
    /// The split broadcast failed; details were logged.
    BroadcastFailed,
}

/// Maintains publish-pool depth by splitting funding inputs.
pub struct Replenisher<S: ?Sized> {
    store: Arc<S>,
    broadcaster: Arc<dyn Broadcaster>,
    key: ServerKey,
    ledger: LedgerConfig,
    config: EngineConfig,
    last_split: Mutex<Option<Instant>>,
}

impl<S: Store + ?Sized> Replenisher<S> {
    /// Create a replenisher.
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
            last_split: Mutex::new(None),
        }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            min_size = self.config.pool_min_size,
            unit_value = self.config.pool_unit_value,
            "replenisher started"
        );
        let mut ticker = tokio::time::interval(self.config.pool_check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.check_once().await {
                        error!(error = %e, "replenisher check failed");
                    }
                }
            }
        }
        info!("replenisher stopped");
    }

    /// One depth check, possibly splitting.
    pub async fn check_once(&self) -> EngineResult<ReplenishAction> {
        let stats = self
            .store
            .pool_stats(self.config.pool_unit_value)
            .await?;

        if stats.unit_available >= self.config.pool_min_size {
            return Ok(ReplenishAction::Idle);
        }

        if let Some(last) = *self.last_split.lock() {
            if last.elapsed() < self.config.pool_split_cooldown() {
                return Ok(ReplenishAction::Cooldown);
            }
        }

        let Some(source) = self.store.largest_source().await? else {
            warn!(
                unit_available = stats.unit_available,
                min_size = self.config.pool_min_size,
                "pool below floor and no funding input available"
            );
            return Ok(ReplenishAction::Alarm);
        };

        let Some(plan) = self.split_plan(&source) else {
            warn!(
                source_id = source.id,
                source_value = source.satoshis,
                "largest funding input too small to split"
            );
            return Ok(ReplenishAction::Alarm);
        };

        let split = build_split_tx(&plan, &self.key, self.ledger.network)?;

        match self.broadcaster.broadcast(&split.built.raw_hex).await {
            BroadcastOutcome::Success(txid) => {
                self.store.mark_spent(source.id, &txid).await?;

                let mut rows: Vec<NewUtxo> = (0..split.unit_count)
                    .map(|vout| NewUtxo {
                        txid: txid.clone(),
                        vout,
                        satoshis: split.unit_value,
                        script_pubkey: split.unit_script_hex.clone(),
                        address: split.unit_address.clone(),
                        purpose: UtxoPurpose::Publish,
                    })
                    .collect();
                rows.push(NewUtxo {
                    txid: txid.clone(),
                    vout: split.change_vout,
                    satoshis: split.change_value,
                    script_pubkey: split.change_script_hex.clone(),
                    address: split.change_address.clone(),
                    purpose: UtxoPurpose::Change,
                });
                self.store.insert_utxos(&rows).await?;

                *self.last_split.lock() = Some(Instant::now());
                info!(
                    %txid,
                    minted = split.unit_count,
                    change = split.change_value,
                    "pool replenished"
                );
                Ok(ReplenishAction::Split {
                    txid,
                    minted: split.unit_count,
                })
            }
            BroadcastOutcome::MempoolConflict(detail) => {
                // The source is already committed to some mempool
                // transaction; exclude it until reconciliation.
                warn!(source_id = source.id, detail, "split source conflicted; marking dirty");
                self.store.mark_dirty(source.id).await?;
                Ok(ReplenishAction::BroadcastFailed)
            }
            BroadcastOutcome::TransientNetwork(detail)
            | BroadcastOutcome::PermanentReject(detail) => {
                warn!(detail, "split broadcast failed");
                Ok(ReplenishAction::BroadcastFailed)
            }
        }
    }

    /// Size a split to the source: as many unit outputs as fit, capped at
    /// the configured target. Returns `None` when not even one fits.
    fn split_plan(&self, source: &Utxo) -> Option<SplitPlan> {
        let unit = self.config.pool_unit_value;
        let rate = self.ledger.fee_rate_sats_per_kb;

        let fits = (source.satoshis / unit).min(u32::MAX as u64) as u32;
        let mut count = self.config.pool_split_target.min(fits);

        while count > 0 {
            // Mirror the builder's sizing: 1 P2PKH input plus count+1 P2PKH
            // outputs at 34 bytes each.
            let vsize = 158 + (count as u64 + 1) * 34;
            let fee = (vsize * rate).div_ceil(1000);
            if source.satoshis >= unit * count as u64 + fee + 1 {
                break;
            }
            count -= 1;
        }

        (count > 0).then(|| SplitPlan {
            source: SpendableInput {
                txid: source.txid.clone(),
                vout: source.vout,
                satoshis: source.satoshis,
                script_pubkey: source.script_pubkey.clone(),
            },
            unit_value: unit,
            unit_count: count,
            fee_rate_sats_per_kb: rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchorite_ledger::{server_address, MockBroadcaster, Network};
    use anchorite_store::{MemoryStore, UtxoPool, UtxoStatus};

    fn server_key() -> ServerKey {
        ServerKey::from_hex(&hex::encode([0x42u8; 32])).unwrap()
    }

    fn ledger_config(key: &ServerKey) -> LedgerConfig {
        LedgerConfig::regtest("http://127.0.0.1:1/broadcast")
            .with_change_address(server_address(key, Network::Regtest).to_string())
    }

    fn funding_row(key: &ServerKey, sats: u64) -> NewUtxo {
        let address = server_address(key, Network::Regtest);
        NewUtxo {
            txid: "ff".repeat(32),
            vout: 0,
            satoshis: sats,
            script_pubkey: hex::encode(address.script_pubkey().as_bytes()),
            address: address.to_string(),
            purpose: UtxoPurpose::Funding,
        }
    }

    fn replenisher(
        store: Arc<MemoryStore>,
        mock: Arc<MockBroadcaster>,
        config: EngineConfig,
    ) -> Replenisher<MemoryStore> {
        let key = server_key();
        let ledger = ledger_config(&key);
        Replenisher::new(store, mock, key, ledger, config)
    }

    fn low_floor_config(min: u64, target: u32) -> EngineConfig {
        EngineConfig {
            pool_min_size: min,
            pool_split_target: target,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn full_pool_is_idle() {
        let store = Arc::new(MemoryStore::new());
        let mock = Arc::new(MockBroadcaster::new());
        let r = replenisher(store, mock, low_floor_config(0, 10));

        assert_eq!(r.check_once().await.unwrap(), ReplenishAction::Idle);
    }

    #[tokio::test]
    async fn low_pool_splits_the_largest_source() {
        let store = Arc::new(MemoryStore::new());
        let mock = Arc::new(MockBroadcaster::new());
        let key = server_key();

        store
            .insert_utxos(&[funding_row(&key, 1_000_000)])
            .await
            .unwrap();

        let r = replenisher(store.clone(), mock.clone(), low_floor_config(50, 100));
        let action = r.check_once().await.unwrap();

        let ReplenishAction::Split { txid, minted } = action else {
            panic!("expected a split, got {action:?}");
        };
        assert_eq!(minted, 100);

        // Source spent, 100 publish rows + 1 change row inserted.
        let source = store.utxo(1).await.unwrap().unwrap();
        assert_eq!(source.status, UtxoStatus::Spent);
        assert_eq!(source.spent_by_txid.as_deref(), Some(txid.as_str()));

        let stats = store.pool_stats(100).await.unwrap();
        assert_eq!(stats.unit_available, 100);
        assert!(store.largest_source().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cooldown_suppresses_back_to_back_splits() {
        let store = Arc::new(MemoryStore::new());
        let mock = Arc::new(MockBroadcaster::new());
        let key = server_key();

        store
            .insert_utxos(&[funding_row(&key, 1_000_000)])
            .await
            .unwrap();

        // Floor high enough that one split cannot satisfy it.
        let r = replenisher(store, mock, low_floor_config(1_000, 100));
        assert!(matches!(
            r.check_once().await.unwrap(),
            ReplenishAction::Split { .. }
        ));
        assert_eq!(r.check_once().await.unwrap(), ReplenishAction::Cooldown);
    }

    #[tokio::test]
    async fn no_source_raises_the_alarm() {
        let store = Arc::new(MemoryStore::new());
        let mock = Arc::new(MockBroadcaster::new());

        let r = replenisher(store, mock.clone(), low_floor_config(50, 100));
        assert_eq!(r.check_once().await.unwrap(), ReplenishAction::Alarm);
        assert_eq!(mock.broadcast_count(), 0);
    }

    #[tokio::test]
    async fn conflicted_source_goes_dirty() {
        let store = Arc::new(MemoryStore::new());
        let mock = Arc::new(MockBroadcaster::new());
        mock.push_outcome(BroadcastOutcome::MempoolConflict("conflict".into()));
        let key = server_key();

        store
            .insert_utxos(&[funding_row(&key, 1_000_000)])
            .await
            .unwrap();

        let r = replenisher(store.clone(), mock, low_floor_config(50, 100));
        assert_eq!(
            r.check_once().await.unwrap(),
            ReplenishAction::BroadcastFailed
        );

        let source = store.utxo(1).await.unwrap().unwrap();
        assert!(source.dirty);
    }

    #[tokio::test]
    async fn undersized_source_raises_the_alarm() {
        let store = Arc::new(MemoryStore::new());
        let mock = Arc::new(MockBroadcaster::new());
        let key = server_key();

        // 50 sats cannot mint even one 100-sat unit.
        store.insert_utxos(&[funding_row(&key, 50)]).await.unwrap();

        let r = replenisher(store, mock, low_floor_config(50, 100));
        assert_eq!(r.check_once().await.unwrap(), ReplenishAction::Alarm);
    }
}
