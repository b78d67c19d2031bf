//! Engine configuration.
//!
//! One struct carrying every recognized knob, with the documented defaults.
//! Field names match the configuration surface; accessors convert to
//! `Duration` for call sites.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Tunables for the admission pipeline, workers, loops, and pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Max |now − record.timestamp|, in seconds.
    pub timestamp_skew_seconds: u64,

    /// UTXO reservation lease, in seconds.
    pub utxo_lease_seconds: u64,

    /// TTL for `sending` jobs before unstick reverts them, in seconds.
    /// Must not exceed the UTXO lease.
    pub sending_ttl_seconds: u64,

    /// How often the unstick sweep runs, in seconds.
    pub unstick_interval_seconds: u64,

    /// Collector window, in milliseconds.
    pub batch_window_ms: u64,

    /// Maximum jobs claimed into one batch.
    pub max_batch_size: u32,

    /// Token bucket capacity.
    pub rate_limit_capacity: u32,

    /// Token bucket refill window, in milliseconds.
    pub rate_limit_window_ms: u64,

    /// Single-job worker tasks per process.
    pub worker_concurrency: u32,

    /// Idle delay when a worker or broadcaster finds no work, in
    /// milliseconds.
    pub idle_delay_ms: u64,

    /// Denomination of publish pool inputs, in satoshis.
    pub pool_unit_value: u64,

    /// Replenish when clean unit-value inputs drop below this.
    pub pool_min_size: u64,

    /// How many unit inputs one split mints.
    pub pool_split_target: u32,

    /// Pool check cadence, in milliseconds.
    pub pool_check_interval_ms: u64,

    /// Minimum spacing between splits, in milliseconds.
    pub pool_split_cooldown_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timestamp_skew_seconds: 600,
            utxo_lease_seconds: 300,
            sending_ttl_seconds: 120,
            unstick_interval_seconds: 30,
            batch_window_ms: 5_000,
            max_batch_size: 500,
            rate_limit_capacity: 500,
            rate_limit_window_ms: 3_000,
            worker_concurrency: 1,
            idle_delay_ms: 1_000,
            pool_unit_value: 100,
            pool_min_size: 50_000,
            pool_split_target: 100_000,
            pool_check_interval_ms: 30_000,
            pool_split_cooldown_ms: 600_000,
        }
    }
}

impl EngineConfig {
    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.sending_ttl_seconds > self.utxo_lease_seconds {
            return Err(EngineError::Config(format!(
                "sending_ttl ({}s) must not exceed utxo_lease ({}s)",
                self.sending_ttl_seconds, self.utxo_lease_seconds
            )));
        }
        if self.rate_limit_capacity == 0 || self.rate_limit_window_ms == 0 {
            return Err(EngineError::Config(
                "rate limit capacity and window must be positive".into(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(EngineError::Config("max_batch_size must be positive".into()));
        }
        if self.pool_unit_value == 0 {
            return Err(EngineError::Config("pool_unit_value must be positive".into()));
        }
        Ok(())
    }

    /// Timestamp skew window.
    pub fn timestamp_skew(&self) -> Duration {
        Duration::from_secs(self.timestamp_skew_seconds)
    }

    /// UTXO lease duration.
    pub fn utxo_lease(&self) -> Duration {
        Duration::from_secs(self.utxo_lease_seconds)
    }

    /// Sending TTL.
    pub fn sending_ttl(&self) -> Duration {
        Duration::from_secs(self.sending_ttl_seconds)
    }

    /// Unstick cadence.
    pub fn unstick_interval(&self) -> Duration {
        Duration::from_secs(self.unstick_interval_seconds)
    }

    /// Collector window.
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    /// Rate limiter window.
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    /// Idle delay.
    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }

    /// Pool check cadence.
    pub fn pool_check_interval(&self) -> Duration {
        Duration::from_millis(self.pool_check_interval_ms)
    }

    /// Split cooldown.
    pub fn pool_split_cooldown(&self) -> Duration {
        Duration::from_millis(self.pool_split_cooldown_ms)
    }
}
