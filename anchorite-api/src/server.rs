//! API server configuration, shared state, and lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::http::header::CONTENT_TYPE;
use axum::http::Method;
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use anchorite_engine::{AdmissionPipeline, EngineConfig};
use anchorite_store::Store;

/// API server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Listen address.
    pub listen_addr: SocketAddr,
    /// Enable permissive CORS.
    pub cors_enabled: bool,
    /// Maximum request body size in bytes.
    pub max_body_size: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".parse().expect("static addr parses"),
            cors_enabled: true,
            max_body_size: 1024 * 1024,
        }
    }
}

/// Shared state threaded into every handler.
pub struct ApiState<S: ?Sized> {
    /// The admission pipeline.
    pub pipeline: AdmissionPipeline<S>,
    /// The backing store, for queries.
    pub store: Arc<S>,
    /// Denomination used for pool depth reporting.
    pub pool_unit_value: u64,
    start_time: Instant,
}

impl<S: Store + ?Sized> ApiState<S> {
    /// Create API state over a store.
    pub fn new(store: Arc<S>, engine_config: &EngineConfig) -> Self {
        Self {
            pipeline: AdmissionPipeline::new(store.clone(), engine_config),
            store,
            pool_unit_value: engine_config.pool_unit_value,
            start_time: Instant::now(),
        }
    }

    /// Seconds since the server started.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// The API server.
pub struct ApiServer<S: ?Sized> {
    config: ApiConfig,
    state: Arc<ApiState<S>>,
}

impl<S: Store + ?Sized + 'static> ApiServer<S> {
    /// Create a server.
    pub fn new(config: ApiConfig, state: Arc<ApiState<S>>) -> Self {
        Self { config, state }
    }

    /// Get a reference to the shared state.
    pub fn state(&self) -> Arc<ApiState<S>> {
        self.state.clone()
    }

    /// Assemble the router with middleware.
    pub fn router(&self) -> Router {
        let cors = if self.config.cors_enabled {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([CONTENT_TYPE])
        } else {
            CorsLayer::new()
        };

        let middleware = ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors);

        crate::rest::create_router(self.state.clone()).layer(middleware)
    }

    /// Serve until the shutdown signal flips.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let router = self.router();
        let listener = TcpListener::bind(&self.config.listen_addr).await?;

        info!("API server listening on {}", self.config.listen_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchorite_store::MemoryStore;

    #[test]
    fn config_defaults() {
        let config = ApiConfig::default();
        assert_eq!(config.listen_addr.port(), 8080);
        assert!(config.cors_enabled);
    }

    #[tokio::test]
    async fn router_assembles() {
        let store = Arc::new(MemoryStore::new());
        let state = Arc::new(ApiState::new(store, &EngineConfig::default()));
        let server = ApiServer::new(ApiConfig::default(), state);
        let _router = server.router();
    }
}
