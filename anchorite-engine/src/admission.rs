//! The admission pipeline.
//!
//! An ordered sequence of fallible checks; each failure maps to one taxonomy
//! kind. The pipeline is side-effect-free until every check has passed, at
//! which point nonce insertion, job creation, and the audit append happen in
//! one store transaction. Concurrent duplicate admissions therefore resolve
//! deterministically: the unique constraints pick exactly one winner.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use anchorite_core::{
    canonicalize, content_hash, AdmissionError, ErrorKind, PublishIntent, RecordHash,
};
use anchorite_store::{AdmitRequest, JobId, JobStore, SignerRegistry, SignerStatus, StoreError};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

/// A successfully admitted intent.
#[derive(Debug, Clone)]
pub struct AdmissionOutcome {
    /// The job anchoring this record content.
    pub job_id: JobId,
    /// External record identifier.
    pub record_id: String,
    /// The record hash that will reach the ledger.
    pub hash: RecordHash,
    /// True when the content had already been admitted and the prior job
    /// is being returned.
    pub duplicate: bool,
}

/// Validates and admits publishing intents.
pub struct AdmissionPipeline<S: ?Sized> {
    store: Arc<S>,
    skew: Duration,
}

impl<S: JobStore + SignerRegistry + ?Sized> AdmissionPipeline<S> {
    /// Create a pipeline over a store.
    pub fn new(store: Arc<S>, config: &EngineConfig) -> Self {
        Self {
            store,
            skew: config.timestamp_skew(),
        }
    }

    /// Run the full admission sequence for one intent.
    ///
    /// Check order is part of the contract: schema, timestamp, replay,
    /// signature, registry. A replayed intent is reported as a replay even
    /// when its signature is also bad.
    pub async fn admit(&self, intent: &PublishIntent) -> EngineResult<AdmissionOutcome> {
        // 1. Structural schema check.
        let record = intent.validate_shape().map_err(|e| {
            AdmissionError::with_detail(ErrorKind::InvalidSchema, e.to_string())
        })?;

        // 2. Timestamp skew. The boundary itself is acceptable.
        let now_ms = Utc::now().timestamp_millis();
        let record_ms = record.timestamp.saturating_mul(1000);
        let skew_ms = self.skew.as_millis() as i64;
        if (now_ms - record_ms).abs() > skew_ms {
            return Err(AdmissionError::with_detail(
                ErrorKind::StaleTimestamp,
                format!("timestamp {} outside ±{}s window", record.timestamp, skew_ms / 1000),
            )
            .into());
        }

        // 3. Replay check. Read-only here; the admit transaction below
        // re-checks under the unique constraint.
        if self
            .store
            .nonce_seen(&intent.signer.pubkey, &record.nonce)
            .await?
        {
            return Err(AdmissionError::new(ErrorKind::ReplayDetected).into());
        }

        // 4. Canonicalize and hash.
        let canonical = canonicalize(&intent.record);
        let hash = content_hash(&intent.record);

        // 5. Signature over the record hash.
        let der = hex::decode(&intent.signature.sig)
            .map_err(|_| AdmissionError::new(ErrorKind::InvalidSignature))?;
        if !anchorite_core::verify_record_signature(&intent.signer.pubkey, hash.as_bytes(), &der) {
            return Err(AdmissionError::new(ErrorKind::InvalidSignature).into());
        }

        // 6. Signer registry.
        let signer = self.store.signer(&intent.signer.pubkey).await?;
        match signer {
            Some(record) if record.status == SignerStatus::Active => {}
            _ => return Err(AdmissionError::new(ErrorKind::UnknownSigner).into()),
        }

        // All checks passed; the write is one transaction.
        let canonical_body =
            String::from_utf8(canonical).expect("canonical bytes are valid UTF-8");
        let admitted = self
            .store
            .admit(AdmitRequest {
                record_id: record.record_id.clone(),
                canonical_body,
                record_hash: hash,
                signer: intent.signer.pubkey,
                nonce: record.nonce.clone(),
            })
            .await
            .map_err(|e| match e {
                StoreError::Replay => {
                    EngineError::Rejected(AdmissionError::new(ErrorKind::ReplayDetected))
                }
                other => EngineError::Store(other),
            })?;

        info!(
            job_id = %admitted.job_id,
            record_id = %record.record_id,
            hash = %hash,
            duplicate = admitted.duplicate,
            "intent admitted"
        );

        Ok(AdmissionOutcome {
            job_id: admitted.job_id,
            record_id: record.record_id,
            hash,
            duplicate: admitted.duplicate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchorite_core::intent::{SignatureBlock, SignerRef, SIGNATURE_ALG, SIGNATURE_HASH};
    use anchorite_core::{ServerKey, PROTOCOL_TAG, PROTOCOL_VERSION};
    use anchorite_store::{JobStatus, MemoryStore, SignerRegistry};
    use serde_json::{json, Value};

    fn publisher() -> ServerKey {
        ServerKey::from_hex(&hex::encode([0x11u8; 32])).unwrap()
    }

    fn record_with(nonce: &str, timestamp: i64) -> Value {
        json!({
            "recordId": "REC-1",
            "eventKind": "REGISTER",
            "assetType": "sound-recording",
            "owners": [{"party": "P-1", "role": "composer", "shareBps": 10000}],
            "timestamp": timestamp,
            "nonce": nonce
        })
    }

    fn signed_intent(key: &ServerKey, record: Value) -> PublishIntent {
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

    async fn pipeline_with_signer(
        key: &ServerKey,
    ) -> (Arc<MemoryStore>, AdmissionPipeline<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.upsert_signer(&key.signer_key(), None).await.unwrap();
        let pipeline = AdmissionPipeline::new(store.clone(), &EngineConfig::default());
        (store, pipeline)
    }

    fn rejected_kind(err: EngineError) -> ErrorKind {
        match err {
            EngineError::Rejected(e) => e.kind,
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fresh_admission_queues_a_job() {
        let key = publisher();
        let (store, pipeline) = pipeline_with_signer(&key).await;

        let intent = signed_intent(&key, record_with("n1", Utc::now().timestamp()));
        let outcome = pipeline.admit(&intent).await.unwrap();

        assert!(!outcome.duplicate);
        assert_eq!(outcome.record_id, "REC-1");

        let job = store.job(&outcome.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.record_hash, outcome.hash);
    }

    #[tokio::test]
    async fn verbatim_resubmission_is_a_replay() {
        let key = publisher();
        let (store, pipeline) = pipeline_with_signer(&key).await;

        let intent = signed_intent(&key, record_with("n1", Utc::now().timestamp()));
        pipeline.admit(&intent).await.unwrap();

        let err = pipeline.admit(&intent).await.unwrap_err();
        assert_eq!(rejected_kind(err), ErrorKind::ReplayDetected);
        assert_eq!(store.count_with_status(JobStatus::Queued), 1);
    }

    #[tokio::test]
    async fn same_body_fresh_nonce_returns_prior_job() {
        let key = publisher();
        let (store, pipeline) = pipeline_with_signer(&key).await;
        let ts = Utc::now().timestamp();

        let first = pipeline
            .admit(&signed_intent(&key, record_with("n1", ts)))
            .await
            .unwrap();
        let second = pipeline
            .admit(&signed_intent(&key, record_with("n2", ts)))
            .await
            .unwrap();

        assert!(second.duplicate);
        assert_eq!(second.job_id, first.job_id);
        assert_eq!(store.count_with_status(JobStatus::Queued), 1);
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected_at_the_boundary() {
        let key = publisher();
        let (_store, pipeline) = pipeline_with_signer(&key).await;

        // 601 s in the past: rejected.
        let stale = signed_intent(&key, record_with("n1", Utc::now().timestamp() - 601));
        let err = pipeline.admit(&stale).await.unwrap_err();
        assert_eq!(rejected_kind(err), ErrorKind::StaleTimestamp);

        // Well inside the window: accepted.
        let fresh = signed_intent(&key, record_with("n2", Utc::now().timestamp() - 599));
        assert!(pipeline.admit(&fresh).await.is_ok());
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let key = publisher();
        let (_store, pipeline) = pipeline_with_signer(&key).await;

        let mut intent = signed_intent(&key, record_with("n1", Utc::now().timestamp()));
        // Sign a different record.
        let other = signed_intent(&key, record_with("n1", Utc::now().timestamp() - 100));
        intent.signature.sig = other.signature.sig;

        let err = pipeline.admit(&intent).await.unwrap_err();
        assert_eq!(rejected_kind(err), ErrorKind::InvalidSignature);
    }

    #[tokio::test]
    async fn garbage_signature_hex_is_rejected() {
        let key = publisher();
        let (_store, pipeline) = pipeline_with_signer(&key).await;

        let mut intent = signed_intent(&key, record_with("n1", Utc::now().timestamp()));
        intent.signature.sig = "zz-not-hex".into();

        let err = pipeline.admit(&intent).await.unwrap_err();
        assert_eq!(rejected_kind(err), ErrorKind::InvalidSignature);
    }

    #[tokio::test]
    async fn unregistered_signer_is_rejected() {
        let key = publisher();
        let store = Arc::new(MemoryStore::new());
        let pipeline = AdmissionPipeline::new(store, &EngineConfig::default());

        let intent = signed_intent(&key, record_with("n1", Utc::now().timestamp()));
        let err = pipeline.admit(&intent).await.unwrap_err();
        assert_eq!(rejected_kind(err), ErrorKind::UnknownSigner);
    }

    #[tokio::test]
    async fn revoked_signer_is_rejected() {
        let key = publisher();
        let (store, pipeline) = pipeline_with_signer(&key).await;
        store.revoke_signer(&key.signer_key()).await.unwrap();

        let intent = signed_intent(&key, record_with("n1", Utc::now().timestamp()));
        let err = pipeline.admit(&intent).await.unwrap_err();
        assert_eq!(rejected_kind(err), ErrorKind::UnknownSigner);
    }

    #[tokio::test]
    async fn malformed_envelope_is_a_schema_error() {
        let key = publisher();
        let (_store, pipeline) = pipeline_with_signer(&key).await;

        let mut intent = signed_intent(&key, record_with("n1", Utc::now().timestamp()));
        intent.record = json!({"recordId": "REC-1"});

        let err = pipeline.admit(&intent).await.unwrap_err();
        assert_eq!(rejected_kind(err), ErrorKind::InvalidSchema);
    }

    #[tokio::test]
    async fn replay_wins_over_bad_signature() {
        let key = publisher();
        let (_store, pipeline) = pipeline_with_signer(&key).await;

        let intent = signed_intent(&key, record_with("n1", Utc::now().timestamp()));
        pipeline.admit(&intent).await.unwrap();

        // Same nonce, corrupted signature: the replay check fires first.
        let mut tampered = intent.clone();
        tampered.signature.sig = "00".into();
        let err = pipeline.admit(&tampered).await.unwrap_err();
        assert_eq!(rejected_kind(err), ErrorKind::ReplayDetected);
    }
}
