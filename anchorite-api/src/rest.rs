//! REST endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use anchorite_core::{AdmissionError, PublishIntent};
use anchorite_engine::EngineError;
use anchorite_store::{JobId, PoolStats, PublishJob, Store, StoreError};

use crate::server::ApiState;

/// REST error response.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The admission pipeline rejected the intent.
    #[error("{0}")]
    Rejected(AdmissionError),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Server-side failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// The store is unreachable.
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Rejected(e) => StatusCode::from_u16(e.kind.http_status())
                .unwrap_or(StatusCode::BAD_REQUEST),
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        let body = serde_json::json!({
            "ok": false,
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

/// Response to an admitted intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentResponse {
    /// Always true on this path.
    pub ok: bool,
    /// External record identifier.
    pub record_id: String,
    /// Record hash, hex.
    pub hash: String,
    /// The job anchoring this record.
    pub job_id: String,
    /// Job status at response time.
    pub status: String,
    /// True when an identical body had already been admitted.
    pub duplicate: bool,
}

/// Job timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTimestamps {
    /// Admission time.
    pub created_at: DateTime<Utc>,
    /// Broadcast-accepted time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

/// Job state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    /// Always true on this path.
    pub ok: bool,
    /// Job id.
    pub job_id: String,
    /// External record identifier.
    pub record_id: String,
    /// Current status.
    pub status: String,
    /// Ledger transaction id, once broadcast.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    /// Error taxonomy code, on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Error detail, on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// Timestamps.
    pub timestamps: JobTimestamps,
}

impl JobResponse {
    fn from_job(job: &PublishJob) -> Self {
        Self {
            ok: true,
            job_id: job.job_id.to_string(),
            record_id: job.record_id.clone(),
            status: job.status.to_string(),
            txid: job.ledger_txid.clone(),
            error_code: job.error_code.clone(),
            error_detail: job.error_detail.clone(),
            timestamps: JobTimestamps {
                created_at: job.created_at,
                sent_at: job.sent_at,
            },
        }
    }
}

/// Latest job for a record, with the stored canonical body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordResponse {
    /// Always true on this path.
    pub ok: bool,
    /// External record identifier.
    pub record_id: String,
    /// Record hash, hex.
    pub hash: String,
    /// Latest job summary.
    pub job: JobResponse,
    /// The canonical record body as admitted.
    pub record: serde_json::Value,
}

/// Pool depth counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolResponse {
    /// Always true on this path.
    pub ok: bool,
    /// Denomination the unit counter refers to.
    pub unit_value: u64,
    /// The counters.
    pub stats: PoolStats,
}

/// Health probe response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Whether the store round-trip succeeded.
    pub ok: bool,
    /// Human-readable status.
    pub status: String,
    /// Seconds since process start.
    pub uptime_seconds: u64,
    /// Server version.
    pub version: String,
}

/// Build the v1 router.
pub fn create_router<S: Store + ?Sized + 'static>(state: Arc<ApiState<S>>) -> Router {
    Router::new()
        .route("/v1/intents", post(submit_intent::<S>))
        .route("/v1/jobs/{id}", get(get_job::<S>))
        .route("/v1/records/{id}", get(get_record::<S>))
        .route("/v1/pool", get(get_pool::<S>))
        .route("/v1/health", get(get_health::<S>))
        .with_state(state)
}

/// POST /v1/intents - run the admission pipeline.
pub(crate) async fn submit_intent<S: Store + ?Sized + 'static>(
    State(state): State<Arc<ApiState<S>>>,
    Json(intent): Json<PublishIntent>,
) -> Result<Json<IntentResponse>, ApiError> {
    let outcome = state.pipeline.admit(&intent).await.map_err(|e| match e {
        EngineError::Rejected(rejection) => {
            warn!(error = %rejection, "intent rejected");
            ApiError::Rejected(rejection)
        }
        other => ApiError::Internal(other.to_string()),
    })?;

    // A duplicate returns the prior job, which may have progressed past
    // queued by now.
    let status = if outcome.duplicate {
        state
            .store
            .job(&outcome.job_id)
            .await?
            .map(|j| j.status.to_string())
            .unwrap_or_else(|| "queued".to_string())
    } else {
        "queued".to_string()
    };

    Ok(Json(IntentResponse {
        ok: true,
        record_id: outcome.record_id,
        hash: outcome.hash.to_hex(),
        job_id: outcome.job_id.to_string(),
        status,
        duplicate: outcome.duplicate,
    }))
}

/// GET /v1/jobs/{id} - job state.
pub(crate) async fn get_job<S: Store + ?Sized + 'static>(
    State(state): State<Arc<ApiState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state
        .store
        .job(&JobId(id.clone()))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {id}")))?;

    Ok(Json(JobResponse::from_job(&job)))
}

/// GET /v1/records/{id} - latest job for a record id.
pub(crate) async fn get_record<S: Store + ?Sized + 'static>(
    State(state): State<Arc<ApiState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<RecordResponse>, ApiError> {
    let job = state
        .store
        .latest_job_for_record(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("record {id}")))?;

    let record: serde_json::Value = serde_json::from_str(&job.canonical_body)
        .map_err(|e| ApiError::Internal(format!("stored body unparseable: {e}")))?;

    Ok(Json(RecordResponse {
        ok: true,
        record_id: job.record_id.clone(),
        hash: job.record_hash.to_hex(),
        job: JobResponse::from_job(&job),
        record,
    }))
}

/// GET /v1/pool - pool depth counters.
pub(crate) async fn get_pool<S: Store + ?Sized + 'static>(
    State(state): State<Arc<ApiState<S>>>,
) -> Result<Json<PoolResponse>, ApiError> {
    let stats = state.store.pool_stats(state.pool_unit_value).await?;
    Ok(Json(PoolResponse {
        ok: true,
        unit_value: state.pool_unit_value,
        stats,
    }))
}

/// GET /v1/health - liveness probe.
pub(crate) async fn get_health<S: Store + ?Sized + 'static>(
    State(state): State<Arc<ApiState<S>>>,
) -> Result<Json<HealthResponse>, ApiError> {
    state
        .store
        .ping()
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;

    Ok(Json(HealthResponse {
        ok: true,
        status: "ok".into(),
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchorite_core::intent::{SignatureBlock, SignerRef, SIGNATURE_ALG, SIGNATURE_HASH};
    use anchorite_core::{content_hash, ServerKey, PROTOCOL_TAG, PROTOCOL_VERSION};
    use anchorite_engine::EngineConfig;
    use anchorite_store::{MemoryStore, SignerRegistry};
    use serde_json::json;

    fn publisher() -> ServerKey {
        ServerKey::from_hex(&hex::encode([0x11u8; 32])).unwrap()
    }

    fn signed_intent(key: &ServerKey, nonce: &str) -> PublishIntent {
        let record = json!({
            "recordId": "REC-1",
            "eventKind": "REGISTER",
            "assetType": "sound-recording",
            "owners": [{"party": "P-1", "role": "composer", "shareBps": 10000}],
            "timestamp": Utc::now().timestamp(),
            "nonce": nonce
        });
        let hash = content_hash(&record);
        let sig = key.sign_digest(hash.as_bytes());
        PublishIntent {
            protocol: PROTOCOL_TAG.into(),
            version: PROTOCOL_VERSION,
            record,
            signer: SignerRef {
                pubkey: key.signer_key(),
            },
            signature: SignatureBlock {
                alg: SIGNATURE_ALG.into(),
                hash: SIGNATURE_HASH.into(),
                sig: hex::encode(sig.serialize_der()),
            },
        }
    }

    async fn state_with_signer(key: &ServerKey) -> Arc<ApiState<MemoryStore>> {
        let store = Arc::new(MemoryStore::new());
        store.upsert_signer(&key.signer_key(), None).await.unwrap();
        Arc::new(ApiState::new(store, &EngineConfig::default()))
    }

    #[tokio::test]
    async fn submit_then_query_job() {
        let key = publisher();
        let state = state_with_signer(&key).await;

        let response = submit_intent(State(state.clone()), Json(signed_intent(&key, "n1")))
            .await
            .unwrap();
        assert!(response.0.ok);
        assert_eq!(response.0.record_id, "REC-1");
        assert_eq!(response.0.status, "queued");
        assert!(!response.0.duplicate);

        let job = get_job(State(state.clone()), Path(response.0.job_id.clone()))
            .await
            .unwrap();
        assert_eq!(job.0.status, "queued");
        assert_eq!(job.0.record_id, "REC-1");
        assert!(job.0.txid.is_none());
    }

    #[tokio::test]
    async fn replay_maps_to_conflict_status() {
        let key = publisher();
        let state = state_with_signer(&key).await;
        let intent = signed_intent(&key, "n1");

        submit_intent(State(state.clone()), Json(intent.clone()))
            .await
            .unwrap();
        let err = submit_intent(State(state), Json(intent)).await.unwrap_err();

        let ApiError::Rejected(rejection) = &err else {
            panic!("expected rejection, got {err:?}");
        };
        assert_eq!(rejection.kind.http_status(), 409);
    }

    #[tokio::test]
    async fn duplicate_body_returns_prior_job_id() {
        let key = publisher();
        let state = state_with_signer(&key).await;

        let first = submit_intent(State(state.clone()), Json(signed_intent(&key, "n1")))
            .await
            .unwrap();
        let second = submit_intent(State(state), Json(signed_intent(&key, "n2")))
            .await
            .unwrap();

        assert!(second.0.duplicate);
        assert_eq!(second.0.job_id, first.0.job_id);
    }

    #[tokio::test]
    async fn record_query_returns_canonical_body() {
        let key = publisher();
        let state = state_with_signer(&key).await;

        submit_intent(State(state.clone()), Json(signed_intent(&key, "n1")))
            .await
            .unwrap();

        let record = get_record(State(state), Path("REC-1".into())).await.unwrap();
        assert_eq!(record.0.record_id, "REC-1");
        assert_eq!(record.0.record["recordId"], "REC-1");
        assert_eq!(record.0.record["nonce"], "n1");
    }

    #[tokio::test]
    async fn missing_job_is_404() {
        let key = publisher();
        let state = state_with_signer(&key).await;

        let err = get_job(State(state), Path("nope".into())).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn health_probe_is_ok() {
        let key = publisher();
        let state = state_with_signer(&key).await;

        let health = get_health(State(state)).await.unwrap();
        assert!(health.0.ok);
        assert_eq!(health.0.status, "ok");
    }
}
