//! Anchorite node entry point.
//!
//! Wires configuration, the Postgres store, the ledger adapter, and the
//! engine loops together, then serves until interrupted. Fatal conditions
//! (unreachable database, missing signing key) terminate the process;
//! supervisory restart is assumed.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use anchorite_api::{ApiServer, ApiState};
use anchorite_core::ServerKey;
use anchorite_engine::{
    BatchBroadcaster, BatchCollector, JobWorker, Replenisher, TokenBucket, UnstickSweeper,
};
use anchorite_ledger::HttpBroadcaster;
use anchorite_store::{JobStore, PgStore};

mod config;

use config::{NodeConfig, ProcessingMode};

#[derive(Parser, Debug)]
#[command(name = "anchorite-node", about = "Anchoring service node", version)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Apply migrations and exit.
    #[arg(long)]
    migrate_only: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => {
            let mut config = NodeConfig::default();
            config.apply_env();
            config
        }
    };
    config.validate()?;

    let key = ServerKey::from_hex(&config.server_key_hex)?;

    let store = PgStore::connect(&config.database_url, config.max_connections).await?;
    store.run_migrations().await?;
    info!("store connected and migrated");

    if args.migrate_only {
        return Ok(());
    }

    // Recover any jobs a previous process left in `sending`.
    let reverted = store.unstick(config.engine.sending_ttl()).await?;
    if reverted > 0 {
        info!(reverted, "recovered stale sending jobs on startup");
    }

    let store = Arc::new(store);
    let broadcaster = Arc::new(HttpBroadcaster::new(&config.ledger)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    // HTTP surface.
    let api_state = Arc::new(ApiState::new(store.clone(), &config.engine));
    let api_server = ApiServer::new(config.api.clone(), api_state);
    {
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            if let Err(e) = api_server.run(shutdown).await {
                error!(error = %e, "API server exited with error");
            }
        });
    }

    // Processing loops.
    match config.processing_mode {
        ProcessingMode::Single => {
            for _ in 0..config.engine.worker_concurrency.max(1) {
                let worker = JobWorker::new(
                    store.clone(),
                    broadcaster.clone(),
                    key.clone(),
                    config.ledger.clone(),
                    config.engine.clone(),
                );
                let shutdown = shutdown_rx.clone();
                tasks.spawn(async move { worker.run(shutdown).await });
            }
        }
        ProcessingMode::Batch => {
            let collector = BatchCollector::new(store.clone(), config.engine.clone());
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { collector.run(shutdown).await });

            let bucket = Arc::new(TokenBucket::new(
                config.engine.rate_limit_capacity,
                config.engine.rate_limit_window(),
            ));
            let batch_broadcaster = BatchBroadcaster::new(
                store.clone(),
                broadcaster.clone(),
                bucket,
                key.clone(),
                config.ledger.clone(),
                config.engine.clone(),
            );
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { batch_broadcaster.run(shutdown).await });

            let sweeper = UnstickSweeper::new(store.clone(), config.engine.clone());
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { sweeper.run(shutdown).await });
        }
    }

    // Pool maintenance runs in both modes.
    let replenisher = Replenisher::new(
        store.clone(),
        broadcaster,
        key,
        config.ledger.clone(),
        config.engine.clone(),
    );
    {
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { replenisher.run(shutdown).await });
    }

    info!(mode = ?config.processing_mode, "anchorite node running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    while tasks.join_next().await.is_some() {}
    info!("all tasks stopped");
    Ok(())
}
