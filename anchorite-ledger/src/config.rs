//! Ledger configuration.

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::DEFAULT_BROADCAST_TIMEOUT_SECS;

/// Target ledger network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Production network.
    #[default]
    Mainnet,
    /// Public test network.
    Testnet,
    /// Local development network.
    Regtest,
}

impl Network {
    /// Get the network name.
    pub fn name(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    /// Convert to the bitcoin crate's network type.
    pub fn to_bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }
}

/// Configuration for the ledger-facing components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Broadcast endpoint URL.
    pub broadcast_url: String,

    /// Target network.
    pub network: Network,

    /// Address change outputs pay to.
    pub change_address: String,

    /// Fee rate in sats per KB of virtual size.
    pub fee_rate_sats_per_kb: u64,

    /// Per-call broadcast timeout in seconds.
    pub timeout_secs: u64,
}

impl LedgerConfig {
    /// Create a new configuration.
    pub fn new(broadcast_url: impl Into<String>, network: Network) -> Self {
        Self {
            broadcast_url: broadcast_url.into(),
            network,
            change_address: String::new(),
            fee_rate_sats_per_kb: 100,
            timeout_secs: DEFAULT_BROADCAST_TIMEOUT_SECS,
        }
    }

    /// Create configuration for regtest.
    pub fn regtest(broadcast_url: impl Into<String>) -> Self {
        Self::new(broadcast_url, Network::Regtest)
    }

    /// Set the change address.
    pub fn with_change_address(mut self, address: impl Into<String>) -> Self {
        self.change_address = address.into();
        self
    }

    /// Set the fee rate in sats/KB.
    pub fn with_fee_rate(mut self, sats_per_kb: u64) -> Self {
        self.fee_rate_sats_per_kb = sats_per_kb;
        self
    }

    /// Set the broadcast timeout.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.broadcast_url.is_empty() {
            return Err(LedgerError::Config("broadcast URL is required".into()));
        }
        if self.change_address.is_empty() {
            return Err(LedgerError::Config("change address is required".into()));
        }
        if self.fee_rate_sats_per_kb == 0 {
            return Err(LedgerError::Config("fee rate must be positive".into()));
        }
        if self.timeout_secs == 0 {
            return Err(LedgerError::Config("timeout must be positive".into()));
        }
        Ok(())
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self::new("http://127.0.0.1:3100/broadcast", Network::Mainnet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_and_validate() {
        let config = LedgerConfig::regtest("http://localhost:3100/broadcast")
            .with_change_address("mipcBbFg9gMiCh81Kj8tqqdgoZub1ZJRfn")
            .with_fee_rate(250)
            .with_timeout(10);

        assert!(config.validate().is_ok());
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.fee_rate_sats_per_kb, 250);
    }

    #[test]
    fn validate_rejects_missing_fields() {
        assert!(LedgerConfig::default().validate().is_err());

        let config = LedgerConfig::regtest("").with_change_address("addr");
        assert!(config.validate().is_err());
    }

    #[test]
    fn network_names() {
        assert_eq!(Network::Mainnet.name(), "mainnet");
        assert_eq!(Network::Regtest.to_bitcoin_network(), bitcoin::Network::Regtest);
    }
}
