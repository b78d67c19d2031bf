//! Row types and state enums for the persisted entities.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use anchorite_core::{RecordHash, SignerKey};

/// Globally unique, opaque job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Mint a fresh job id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque batch identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub String);

impl BatchId {
    /// Mint a fresh batch id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job lifecycle states.
///
/// `queued → processing → (sent | failed)` on the single-job path, and
/// `queued → processing_batch → sending → (sent | failed)` on the batched
/// path, with `sending → processing_batch` as the only backward edge
/// (unstick after the sending TTL).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Admitted, waiting for a worker or collector.
    Queued,
    /// Claimed by the single-job worker.
    Processing,
    /// Claimed into a batch, waiting for the broadcaster.
    ProcessingBatch,
    /// Broadcast in flight.
    Sending,
    /// Broadcast accepted by the ledger. Terminal.
    Sent,
    /// Terminal failure; `error_code` carries the taxonomy kind.
    Failed,
}

impl JobStatus {
    /// The persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::ProcessingBatch => "processing_batch",
            JobStatus::Sending => "sending",
            JobStatus::Sent => "sent",
            JobStatus::Failed => "failed",
        }
    }

    /// Parse the persisted representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "processing_batch" => Some(JobStatus::ProcessingBatch),
            "sending" => Some(JobStatus::Sending),
            "sent" => Some(JobStatus::Sent),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Whether the job can never leave this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Sent | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A publish job row.
#[derive(Debug, Clone)]
pub struct PublishJob {
    /// Surrogate key.
    pub id: i64,
    /// Globally unique job id.
    pub job_id: JobId,
    /// External record identifier from the intent.
    pub record_id: String,
    /// The canonical record body as admitted (UTF-8 JSON).
    pub canonical_body: String,
    /// SHA-256 of the canonical body. Globally unique.
    pub record_hash: RecordHash,
    /// Who signed the intent.
    pub signer: SignerKey,
    /// Current state.
    pub status: JobStatus,
    /// Ledger transaction id, set on successful broadcast.
    pub ledger_txid: Option<String>,
    /// Error taxonomy code, set on failure.
    pub error_code: Option<String>,
    /// Error detail, set on failure.
    pub error_detail: Option<String>,
    /// Batch assignment (batched path only).
    pub batch_id: Option<BatchId>,
    /// Dense 1..N position within the batch.
    pub batch_seq: Option<i32>,
    /// When the broadcaster moved this job to `sending`.
    pub sending_started_at: Option<DateTime<Utc>>,
    /// Admission time.
    pub created_at: DateTime<Utc>,
    /// Broadcast-accepted time.
    pub sent_at: Option<DateTime<Utc>>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// What `JobStore::admit` needs, all derived during validation.
#[derive(Debug, Clone)]
pub struct AdmitRequest {
    /// External record identifier.
    pub record_id: String,
    /// Canonical record bytes as UTF-8.
    pub canonical_body: String,
    /// Hash of the canonical body.
    pub record_hash: RecordHash,
    /// The admitted signer.
    pub signer: SignerKey,
    /// The intent's nonce.
    pub nonce: String,
}

/// Outcome of an admission write.
#[derive(Debug, Clone)]
pub struct Admitted {
    /// The job representing this record hash.
    pub job_id: JobId,
    /// True when an identical body had already been admitted and the
    /// prior job is being returned.
    pub duplicate: bool,
}

/// Optional fields written alongside a status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    /// Ledger transaction id (success path).
    pub ledger_txid: Option<String>,
    /// Error taxonomy code (failure path).
    pub error_code: Option<String>,
    /// Error detail (failure path).
    pub error_detail: Option<String>,
}

impl TransitionFields {
    /// Fields for a successful broadcast.
    pub fn sent(ledger_txid: impl Into<String>) -> Self {
        Self {
            ledger_txid: Some(ledger_txid.into()),
            ..Self::default()
        }
    }

    /// Fields for a terminal failure.
    pub fn failed(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            error_code: Some(code.into()),
            error_detail: Some(detail.into()),
            ..Self::default()
        }
    }
}

/// What a pool input is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtxoPurpose {
    /// A unit-value input consumed by one publish transaction.
    Publish,
    /// A large input the replenisher splits.
    Funding,
    /// Change from a previous split or publish.
    Change,
}

impl UtxoPurpose {
    /// The persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            UtxoPurpose::Publish => "publish",
            UtxoPurpose::Funding => "funding",
            UtxoPurpose::Change => "change",
        }
    }

    /// Parse the persisted representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "publish" => Some(UtxoPurpose::Publish),
            "funding" => Some(UtxoPurpose::Funding),
            "change" => Some(UtxoPurpose::Change),
            _ => None,
        }
    }
}

/// Pool input states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtxoStatus {
    /// Selectable (unless dirty).
    Available,
    /// Leased to a worker until `reserved_until`.
    Reserved,
    /// Consumed by a broadcast transaction. Never reverts.
    Spent,
}

impl UtxoStatus {
    /// The persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            UtxoStatus::Available => "available",
            UtxoStatus::Reserved => "reserved",
            UtxoStatus::Spent => "spent",
        }
    }

    /// Parse the persisted representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(UtxoStatus::Available),
            "reserved" => Some(UtxoStatus::Reserved),
            "spent" => Some(UtxoStatus::Spent),
            _ => None,
        }
    }
}

/// A pool input row.
#[derive(Debug, Clone)]
pub struct Utxo {
    /// Surrogate key.
    pub id: i64,
    /// Ledger transaction id of the output.
    pub txid: String,
    /// Output index within that transaction.
    pub vout: u32,
    /// Value in satoshis.
    pub satoshis: u64,
    /// Locking script, hex.
    pub script_pubkey: String,
    /// Address form of the locking script.
    pub address: String,
    /// What this input is for.
    pub purpose: UtxoPurpose,
    /// Current state.
    pub status: UtxoStatus,
    /// When the current lease was taken.
    pub reserved_at: Option<DateTime<Utc>>,
    /// Lease deadline.
    pub reserved_until: Option<DateTime<Utc>>,
    /// Excluded from selection pending reconciliation.
    pub dirty: bool,
    /// When the input was spent.
    pub spent_at: Option<DateTime<Utc>>,
    /// The transaction that spent it.
    pub spent_by_txid: Option<String>,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
}

/// A new pool input to insert (bootstrap or replenisher).
#[derive(Debug, Clone)]
pub struct NewUtxo {
    /// Ledger transaction id.
    pub txid: String,
    /// Output index.
    pub vout: u32,
    /// Value in satoshis.
    pub satoshis: u64,
    /// Locking script, hex.
    pub script_pubkey: String,
    /// Address form.
    pub address: String,
    /// Purpose of the input.
    pub purpose: UtxoPurpose,
}

/// What `UtxoPool::reserve` hands a worker.
#[derive(Debug, Clone)]
pub struct ReservedUtxo {
    /// Surrogate key, used for spend/release bookkeeping.
    pub id: i64,
    /// Ledger transaction id.
    pub txid: String,
    /// Output index.
    pub vout: u32,
    /// Value in satoshis.
    pub satoshis: u64,
    /// Locking script, hex.
    pub script_pubkey: String,
}

/// Pool depth summary for the replenisher and operators.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Clean available publish inputs at exactly the unit value.
    pub unit_available: u64,
    /// All available publish inputs.
    pub publish_available: u64,
    /// Currently leased inputs.
    pub reserved: u64,
    /// Spent inputs.
    pub spent: u64,
    /// Dirty inputs awaiting reconciliation.
    pub dirty: u64,
}

/// Registered signer states. Transitions are monotonic: active → revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignerStatus {
    /// May admit intents.
    Active,
    /// May no longer admit intents.
    Revoked,
}

impl SignerStatus {
    /// The persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SignerStatus::Active => "active",
            SignerStatus::Revoked => "revoked",
        }
    }

    /// Parse the persisted representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SignerStatus::Active),
            "revoked" => Some(SignerStatus::Revoked),
            _ => None,
        }
    }
}

/// A signer registry row.
#[derive(Debug, Clone)]
pub struct SignerRecord {
    /// The signer's compressed public key.
    pub pubkey: SignerKey,
    /// Current status.
    pub status: SignerStatus,
    /// Optional policy blob, interpreted elsewhere.
    pub policy: Option<Value>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

/// An audit log row.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// Surrogate key; also the append order.
    pub id: i64,
    /// Event type, e.g. "PUBLISH_INTENT".
    pub event_type: String,
    /// Acting signer, when one is involved.
    pub actor: Option<SignerKey>,
    /// Resource type, e.g. "job".
    pub resource_type: String,
    /// Resource identifier.
    pub resource_id: String,
    /// Action, e.g. "submit".
    pub action: String,
    /// Free-form detail blob.
    pub details: Option<Value>,
    /// Append time.
    pub created_at: DateTime<Utc>,
}

/// A new audit event to append.
#[derive(Debug, Clone)]
pub struct NewAuditEvent {
    /// Event type.
    pub event_type: String,
    /// Acting signer.
    pub actor: Option<SignerKey>,
    /// Resource type.
    pub resource_type: String,
    /// Resource identifier.
    pub resource_id: String,
    /// Action.
    pub action: String,
    /// Free-form detail blob.
    pub details: Option<Value>,
}

impl NewAuditEvent {
    /// Shorthand for a job-scoped event.
    pub fn job(action: impl Into<String>, job_id: &JobId, actor: Option<SignerKey>) -> Self {
        Self {
            event_type: "PUBLISH_INTENT".into(),
            actor,
            resource_type: "job".into(),
            resource_id: job_id.to_string(),
            action: action.into(),
            details: None,
        }
    }

    /// Attach a detail blob.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}
