//! End-to-end flows over the in-memory store and the mock broadcaster:
//! admission through batch collection, ordered rate-limited draining, and
//! crash recovery.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;

use anchorite_core::intent::{SignatureBlock, SignerRef, SIGNATURE_ALG, SIGNATURE_HASH};
use anchorite_core::{content_hash, PublishIntent, ServerKey, PROTOCOL_TAG, PROTOCOL_VERSION};
use anchorite_engine::{
    AdmissionPipeline, BatchBroadcaster, BatchCollector, EngineConfig, TokenBucket, UnstickSweeper,
};
use anchorite_ledger::{
    server_address, BroadcastOutcome, LedgerConfig, MockBroadcaster, Network,
};
use anchorite_store::{
    AdmitRequest, AuditLog, JobStatus, JobStore, MemoryStore, NewUtxo, SignerRegistry,
    StoreError, UtxoPool, UtxoPurpose, UtxoStatus,
};

fn server_key() -> ServerKey {
    ServerKey::from_hex(&hex::encode([0x42u8; 32])).unwrap()
}

fn publisher() -> ServerKey {
    ServerKey::from_hex(&hex::encode([0x11u8; 32])).unwrap()
}

fn ledger_config(key: &ServerKey) -> LedgerConfig {
    LedgerConfig::regtest("http://127.0.0.1:1/broadcast")
        .with_change_address(server_address(key, Network::Regtest).to_string())
}

fn pool_rows(key: &ServerKey, n: u32) -> Vec<NewUtxo> {
    let address = server_address(key, Network::Regtest);
    let script = hex::encode(address.script_pubkey().as_bytes());
    (0..n)
        .map(|i| NewUtxo {
            txid: format!("{i:064x}"),
            vout: 0,
            satoshis: 100_000,
            script_pubkey: script.clone(),
            address: address.to_string(),
            purpose: UtxoPurpose::Publish,
        })
        .collect()
}

fn signed_intent(key: &ServerKey, record_id: &str, nonce: &str) -> PublishIntent {
    let record = json!({
        "recordId": record_id,
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

fn batch_broadcaster(
    store: Arc<MemoryStore>,
    mock: Arc<MockBroadcaster>,
    config: EngineConfig,
) -> BatchBroadcaster<MemoryStore> {
    let key = server_key();
    let ledger = ledger_config(&key);
    let bucket = Arc::new(TokenBucket::new(
        config.rate_limit_capacity,
        config.rate_limit_window(),
    ));
    BatchBroadcaster::new(store, mock, bucket, key, ledger, config)
}

fn idle_shutdown() -> watch::Receiver<bool> {
    watch::channel(false).1
}

#[tokio::test]
async fn admitted_batch_is_anchored_in_order() {
    let store = Arc::new(MemoryStore::new());
    let mock = Arc::new(MockBroadcaster::new());
    let signer = publisher();
    let server = server_key();

    store
        .upsert_signer(&signer.signer_key(), None)
        .await
        .unwrap();
    store.insert_utxos(&pool_rows(&server, 16)).await.unwrap();

    let pipeline = AdmissionPipeline::new(store.clone(), &EngineConfig::default());
    let mut job_ids = Vec::new();
    for i in 0..8 {
        let intent = signed_intent(&signer, &format!("REC-{i}"), &format!("n{i}"));
        let outcome = pipeline.admit(&intent).await.unwrap();
        job_ids.push(outcome.job_id);
    }

    BatchCollector::new(store.clone(), EngineConfig::default())
        .collect_once()
        .await
        .unwrap();

    batch_broadcaster(store.clone(), mock.clone(), EngineConfig::default())
        .drain_oldest_batch(&idle_shutdown())
        .await
        .unwrap();

    // Every job is sent, seq assignment follows admission order, and each
    // ledger txid corresponds to exactly one spent pool row.
    let mut txids = HashSet::new();
    for (i, job_id) in job_ids.iter().enumerate() {
        let job = store.job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Sent);
        assert_eq!(job.batch_seq, Some(i as i32 + 1));
        assert!(txids.insert(job.ledger_txid.clone().unwrap()));
    }

    let mut spent_by = HashSet::new();
    for id in 1..=16 {
        if let Some(utxo) = store.utxo(id).await.unwrap() {
            if utxo.status == UtxoStatus::Spent {
                assert!(spent_by.insert(utxo.spent_by_txid.unwrap()));
            }
        }
    }
    assert_eq!(spent_by, txids);
    assert_eq!(mock.broadcast_count(), 8);

    // The audit trail for each job records both the submission and the
    // broadcast, in order.
    let trail = store
        .audit_for_resource("job", job_ids[0].as_str())
        .await
        .unwrap();
    let actions: Vec<&str> = trail.iter().map(|e| e.action.as_str()).collect();
    assert_eq!(actions, vec!["submit", "broadcast"]);
}

#[tokio::test]
async fn concurrent_replays_admit_exactly_once() {
    let store = Arc::new(MemoryStore::new());
    let signer = publisher().signer_key();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .admit(AdmitRequest {
                    record_id: "REC-1".into(),
                    canonical_body: "{\"a\":1}".into(),
                    record_hash: anchorite_core::RecordHash::digest(b"{\"a\":1}"),
                    signer,
                    nonce: "n1".into(),
                })
                .await
        }));
    }

    let mut admitted = 0;
    let mut replays = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) => {
                assert!(!outcome.duplicate);
                admitted += 1;
            }
            Err(StoreError::Replay) => replays += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(replays, 15);
}

#[tokio::test]
async fn recovery_retries_and_tolerates_duplicate_submission() {
    let store = Arc::new(MemoryStore::new());
    let server = server_key();
    let signer = publisher();

    store
        .upsert_signer(&signer.signer_key(), None)
        .await
        .unwrap();
    store.insert_utxos(&pool_rows(&server, 8)).await.unwrap();

    let pipeline = AdmissionPipeline::new(store.clone(), &EngineConfig::default());
    let mut job_ids = Vec::new();
    for i in 0..3 {
        let outcome = pipeline
            .admit(&signed_intent(&signer, &format!("REC-{i}"), &format!("n{i}")))
            .await
            .unwrap();
        job_ids.push(outcome.job_id);
    }

    BatchCollector::new(store.clone(), EngineConfig::default())
        .collect_once()
        .await
        .unwrap();
    let batch_id = store
        .job(&job_ids[0])
        .await
        .unwrap()
        .unwrap()
        .batch_id
        .unwrap();

    // Crash after the first job reached `sending` but before broadcast
    // completed.
    let stuck = store.claim_next_in_batch(&batch_id).await.unwrap().unwrap();
    assert_eq!(stuck.job_id, job_ids[0]);

    // Restart path: unstick, then resume. The original submission did reach
    // the ledger, so the retry reports a mempool conflict; per the error
    // contract that is terminal for the job and dirties the input.
    let sweeper = UnstickSweeper::new(
        store.clone(),
        EngineConfig {
            sending_ttl_seconds: 0,
            ..Default::default()
        },
    );
    assert_eq!(sweeper.sweep_once().await.unwrap(), 1);

    let mock = Arc::new(MockBroadcaster::new());
    mock.push_outcome(BroadcastOutcome::MempoolConflict(
        "txn-already-in-mempool".into(),
    ));

    batch_broadcaster(store.clone(), mock.clone(), EngineConfig::default())
        .drain_oldest_batch(&idle_shutdown())
        .await
        .unwrap();

    let first = store.job(&job_ids[0]).await.unwrap().unwrap();
    assert_eq!(first.status, JobStatus::Failed);
    assert_eq!(first.error_code.as_deref(), Some("MempoolConflict"));

    // The rest of the batch still drains to sent, in order.
    for job_id in &job_ids[1..] {
        let job = store.job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Sent);
    }
}

#[tokio::test(start_paused = true)]
async fn sustained_drain_is_rate_limited() {
    let store = Arc::new(MemoryStore::new());
    let mock = Arc::new(MockBroadcaster::new());
    let server = server_key();
    let signer = publisher();

    store
        .upsert_signer(&signer.signer_key(), None)
        .await
        .unwrap();
    store.insert_utxos(&pool_rows(&server, 64)).await.unwrap();

    let pipeline = AdmissionPipeline::new(store.clone(), &EngineConfig::default());
    for i in 0..30 {
        pipeline
            .admit(&signed_intent(&signer, &format!("REC-{i}"), &format!("n{i}")))
            .await
            .unwrap();
    }

    BatchCollector::new(store.clone(), EngineConfig::default())
        .collect_once()
        .await
        .unwrap();

    // Capacity 10 over 1 s: 30 jobs need the burst plus two windows.
    let config = EngineConfig {
        rate_limit_capacity: 10,
        rate_limit_window_ms: 1_000,
        ..Default::default()
    };
    let start = tokio::time::Instant::now();
    batch_broadcaster(store.clone(), mock.clone(), config)
        .drain_oldest_batch(&idle_shutdown())
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(mock.broadcast_count(), 30);
    assert!(elapsed >= Duration::from_millis(1900), "elapsed {elapsed:?}");
    assert_eq!(store.count_with_status(JobStatus::Sent), 30);
}
