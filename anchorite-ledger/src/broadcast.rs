//! Broadcast adapter for the external ledger.
//!
//! The ledger exposes a single HTTP endpoint that accepts raw transaction
//! hex and answers with a transaction id or an error message. This adapter
//! normalizes every possible result into [`BroadcastOutcome`] so callers
//! switch on a tag instead of inspecting error strings at each call site.
//! No retries happen here; retry policy belongs to the workers.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result};

/// Normalized result of one broadcast attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// The ledger accepted the transaction.
    Success(String),
    /// An input is already spent by a mempool transaction, or this very
    /// txid is already known. Benign on retry; the UTXO goes dirty.
    MempoolConflict(String),
    /// Timeout, connection failure, or a 5xx from the ledger.
    TransientNetwork(String),
    /// Anything else: the ledger rejected the transaction for good.
    PermanentReject(String),
}

/// A sink for raw transactions.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Submit raw transaction hex. Never fails; every result is an outcome.
    async fn broadcast(&self, raw_tx_hex: &str) -> BroadcastOutcome;
}

#[derive(Serialize)]
struct BroadcastRequest<'a> {
    tx: &'a str,
}

#[derive(Deserialize)]
struct BroadcastResponse {
    #[serde(default)]
    txid: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Error-message fragments the ledger uses for mempool conflicts.
const CONFLICT_MARKERS: &[&str] = &[
    "txn-mempool-conflict",
    "txn-already-in-mempool",
    "txn-already-known",
    "already in the mempool",
    "already known",
    "missing-or-spent",
    "missingorspent",
    "already in block chain",
];

/// Classify a ledger error message.
pub(crate) fn classify_reject(message: &str) -> BroadcastOutcome {
    let lowered = message.to_ascii_lowercase();
    if CONFLICT_MARKERS.iter().any(|m| lowered.contains(m)) {
        BroadcastOutcome::MempoolConflict(message.to_string())
    } else {
        BroadcastOutcome::PermanentReject(message.to_string())
    }
}

/// HTTP client for the ledger broadcast endpoint.
pub struct HttpBroadcaster {
    client: reqwest::Client,
    url: String,
}

impl HttpBroadcaster {
    /// Create a broadcaster from the ledger configuration.
    pub fn new(config: &LedgerConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LedgerError::Config(e.to_string()))?;

        Ok(Self {
            client,
            url: config.broadcast_url.clone(),
        })
    }
}

#[async_trait]
impl Broadcaster for HttpBroadcaster {
    async fn broadcast(&self, raw_tx_hex: &str) -> BroadcastOutcome {
        let response = self
            .client
            .post(&self.url)
            .json(&BroadcastRequest { tx: raw_tx_hex })
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                // Timeouts and connection errors are always retryable from
                // the caller's point of view.
                return BroadcastOutcome::TransientNetwork(e.to_string());
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => return BroadcastOutcome::TransientNetwork(e.to_string()),
        };

        if status.is_server_error() {
            return BroadcastOutcome::TransientNetwork(format!("ledger returned {status}: {body}"));
        }

        let parsed: BroadcastResponse = match serde_json::from_str(&body) {
            Ok(p) => p,
            Err(_) => {
                return classify_reject(&format!("unparseable ledger response ({status}): {body}"))
            }
        };

        match (status.is_success(), parsed.txid, parsed.error) {
            (true, Some(txid), _) => {
                debug!(%txid, "broadcast accepted");
                BroadcastOutcome::Success(txid)
            }
            (_, _, Some(error)) => classify_reject(&error),
            _ => classify_reject(&format!("ledger returned {status} with no txid: {body}")),
        }
    }
}
