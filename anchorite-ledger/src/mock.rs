//! Mock broadcaster for tests and development.
//!
//! Scriptable: outcomes queued with [`MockBroadcaster::push_outcome`] are
//! returned in order; once the queue is empty every broadcast succeeds with
//! a fresh deterministic txid. All submitted raw transactions are recorded
//! for inspection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::broadcast::{BroadcastOutcome, Broadcaster};

/// Mock implementation of [`Broadcaster`].
#[derive(Default)]
pub struct MockBroadcaster {
    scripted: Mutex<VecDeque<BroadcastOutcome>>,
    submitted: Mutex<Vec<String>>,
    tx_counter: AtomicU64,
    latency: Option<Duration>,
}

impl MockBroadcaster {
    /// Create a mock that always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock with simulated per-call latency.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Queue the outcome of the next unscripted broadcast.
    pub fn push_outcome(&self, outcome: BroadcastOutcome) {
        self.scripted.lock().push_back(outcome);
    }

    /// Queue `n` copies of an outcome.
    pub fn push_outcomes(&self, outcome: BroadcastOutcome, n: usize) {
        let mut scripted = self.scripted.lock();
        for _ in 0..n {
            scripted.push_back(outcome.clone());
        }
    }

    /// How many transactions have been submitted.
    pub fn broadcast_count(&self) -> usize {
        self.submitted.lock().len()
    }

    /// All submitted raw transactions, in order.
    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().clone()
    }

    fn next_txid(&self) -> String {
        let counter = self.tx_counter.fetch_add(1, Ordering::Relaxed);
        format!("{counter:064x}")
    }
}

#[async_trait]
impl Broadcaster for MockBroadcaster {
    async fn broadcast(&self, raw_tx_hex: &str) -> BroadcastOutcome {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        self.submitted.lock().push(raw_tx_hex.to_string());

        if let Some(outcome) = self.scripted.lock().pop_front() {
            return outcome;
        }
        BroadcastOutcome::Success(self.next_txid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_outcomes_then_success() {
        let mock = MockBroadcaster::new();
        mock.push_outcome(BroadcastOutcome::MempoolConflict("conflict".into()));

        assert!(matches!(
            mock.broadcast("aa").await,
            BroadcastOutcome::MempoolConflict(_)
        ));
        assert!(matches!(mock.broadcast("bb").await, BroadcastOutcome::Success(_)));
        assert_eq!(mock.broadcast_count(), 2);
        assert_eq!(mock.submitted(), vec!["aa".to_string(), "bb".to_string()]);
    }

    #[tokio::test]
    async fn txids_are_distinct() {
        let mock = MockBroadcaster::new();
        let BroadcastOutcome::Success(a) = mock.broadcast("aa").await else {
            panic!("expected success");
        };
        let BroadcastOutcome::Success(b) = mock.broadcast("aa").await else {
            panic!("expected success");
        };
        assert_ne!(a, b);
    }
}
