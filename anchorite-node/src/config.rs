//! Node configuration.
//!
//! One JSON file aggregating the per-crate configs, with environment
//! overrides for the two deployment secrets (database URL and signing key)
//! so they can stay out of the file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use anchorite_api::ApiConfig;
use anchorite_engine::EngineConfig;
use anchorite_ledger::LedgerConfig;

/// Which processing path drains the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    /// Single-job workers; suitable for low volume.
    Single,
    /// Batch collector + rate-limited broadcaster.
    #[default]
    Batch,
}

/// Full node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Postgres connection URL.
    pub database_url: String,
    /// Connection pool size.
    pub max_connections: u32,
    /// Server signing key, 64 hex characters.
    pub server_key_hex: String,
    /// Processing mode.
    pub processing_mode: ProcessingMode,
    /// HTTP surface.
    pub api: ApiConfig,
    /// Ledger endpoint and fee policy.
    pub ledger: LedgerConfig,
    /// Engine tunables.
    pub engine: EngineConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://anchorite@localhost/anchorite".into(),
            max_connections: 16,
            server_key_hex: String::new(),
            processing_mode: ProcessingMode::default(),
            api: ApiConfig::default(),
            ledger: LedgerConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load from a JSON file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        let mut config: NodeConfig = serde_json::from_str(&text)
            .map_err(|e| format!("cannot parse {}: {e}", path.display()))?;
        config.apply_env();
        Ok(config)
    }

    /// Environment overrides for deployment secrets.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("ANCHORITE_DATABASE_URL") {
            self.database_url = url;
        }
        if let Ok(key) = std::env::var("ANCHORITE_SERVER_KEY") {
            self.server_key_hex = key;
        }
    }

    /// Validate the aggregate.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.database_url.is_empty() {
            return Err("database_url is required".into());
        }
        if self.server_key_hex.is_empty() {
            return Err("server key is required (server_key_hex or ANCHORITE_SERVER_KEY)".into());
        }
        self.ledger.validate()?;
        self.engine.validate()?;
        Ok(())
    }
}
