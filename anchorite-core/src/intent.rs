//! The publishing-intent envelope and the rights record it carries.
//!
//! An intent is the signed declaration that a rights record should be
//! anchored. The envelope wrapper (protocol tag, signer, signature) is never
//! part of the canonical bytes; only the `record` subtree is hashed and
//! signed. The record is kept as raw JSON so that admission hashes exactly
//! what the publisher signed, including fields this server does not model.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::SignerKey;
use crate::error::{CoreError, CoreResult};
use crate::{PROTOCOL_TAG, PROTOCOL_VERSION};

/// Signature algorithm accepted in the envelope.
pub const SIGNATURE_ALG: &str = "ecdsa-secp256k1";

/// Hash name accepted in the envelope.
pub const SIGNATURE_HASH: &str = "sha-256";

/// Total owner shares in basis points.
pub const FULL_SHARE_BPS: u32 = 10_000;

/// What a rights record declares about its subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// First registration of the work.
    Register,
    /// Metadata update to an existing record.
    Update,
    /// Transfer of rights to another party.
    Assign,
    /// Change to the ownership split table.
    SplitChange,
}

/// One party's stake in the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerSplit {
    /// Opaque party identifier.
    pub party: String,
    /// The party's role (e.g. "composer", "publisher").
    pub role: String,
    /// Share in basis points; all shares sum to 10000.
    pub share_bps: u32,
}

/// Optional pointer to distributable content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionHint {
    /// External URI of the content.
    pub uri: String,
    /// Hash of the content at that URI.
    pub content_hash: String,
}

/// Licensing terms attached to the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Terms {
    /// Territory code the rights apply in.
    pub territory: String,
    /// The set of rights granted.
    pub rights: Vec<String>,
}

/// The typed view of a record body, used for structural validation.
///
/// Unknown fields are permitted (and participate in the record hash via the
/// raw JSON); the typed view only checks what admission needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RightsRecord {
    /// External record identifier.
    pub record_id: String,
    /// Event kind.
    pub event_kind: EventKind,
    /// Asset type (e.g. "sound-recording").
    pub asset_type: String,
    /// Ownership split table.
    #[serde(default)]
    pub owners: Vec<OwnerSplit>,
    /// Optional distribution pointer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution: Option<DistributionHint>,
    /// Optional licensing terms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms: Option<Terms>,
    /// Unix timestamp (seconds) the publisher created the record.
    pub timestamp: i64,
    /// Publisher-chosen replay-protection nonce.
    pub nonce: String,
}

impl RightsRecord {
    /// Parse the typed view out of a raw record body.
    pub fn from_value(value: &Value) -> CoreResult<Self> {
        let record: RightsRecord = serde_json::from_value(value.clone())
            .map_err(|e| CoreError::InvalidRecord(e.to_string()))?;
        record.validate()?;
        Ok(record)
    }

    /// Structural checks beyond what serde enforces.
    pub fn validate(&self) -> CoreResult<()> {
        if self.record_id.is_empty() {
            return Err(CoreError::InvalidRecord("recordId is empty".into()));
        }
        if self.nonce.is_empty() {
            return Err(CoreError::InvalidRecord("nonce is empty".into()));
        }
        if self.timestamp <= 0 {
            return Err(CoreError::InvalidRecord("timestamp must be positive".into()));
        }
        if !self.owners.is_empty() {
            let total: u32 = self.owners.iter().map(|o| o.share_bps).sum();
            if total != FULL_SHARE_BPS {
                return Err(CoreError::InvalidRecord(format!(
                    "owner shares sum to {total} bps, expected {FULL_SHARE_BPS}"
                )));
            }
        }
        if let Some(hint) = &self.distribution {
            if hint.content_hash.is_empty() {
                return Err(CoreError::InvalidRecord(
                    "distribution.contentHash is empty".into(),
                ));
            }
        }
        Ok(())
    }
}

/// The signer reference in the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerRef {
    /// Compressed public key, hex.
    pub pubkey: SignerKey,
}

/// The detached signature block in the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureBlock {
    /// Signature algorithm identifier.
    pub alg: String,
    /// Hash function identifier.
    pub hash: String,
    /// DER-encoded signature, hex.
    pub sig: String,
}

/// The full publishing-intent envelope as received on the wire.
///
/// Only the structured `{signer, signature}` form is accepted; flat
/// envelopes are a schema error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishIntent {
    /// Protocol tag, always `sl-drm`.
    pub protocol: String,
    /// Protocol version, always 1.
    pub version: u32,
    /// The raw record body. Hashed and signed as submitted.
    pub record: Value,
    /// Who signed.
    pub signer: SignerRef,
    /// The signature over the record hash.
    pub signature: SignatureBlock,
}

impl PublishIntent {
    /// Structural schema check: protocol constants, enumerations, and the
    /// typed record view. Returns the parsed record on success.
    pub fn validate_shape(&self) -> CoreResult<RightsRecord> {
        if self.protocol != PROTOCOL_TAG {
            return Err(CoreError::InvalidRecord(format!(
                "unknown protocol {:?}",
                self.protocol
            )));
        }
        if self.version != PROTOCOL_VERSION {
            return Err(CoreError::InvalidRecord(format!(
                "unsupported version {}",
                self.version
            )));
        }
        if self.signature.alg != SIGNATURE_ALG {
            return Err(CoreError::InvalidRecord(format!(
                "unsupported signature alg {:?}",
                self.signature.alg
            )));
        }
        if self.signature.hash != SIGNATURE_HASH {
            return Err(CoreError::InvalidRecord(format!(
                "unsupported signature hash {:?}",
                self.signature.hash
            )));
        }
        if !self.record.is_object() {
            return Err(CoreError::InvalidRecord("record must be an object".into()));
        }
        RightsRecord::from_value(&self.record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_record() -> Value {
        json!({
            "recordId": "REC-1",
            "eventKind": "REGISTER",
            "assetType": "sound-recording",
            "owners": [
                {"party": "P-1", "role": "composer", "shareBps": 6000},
                {"party": "P-2", "role": "publisher", "shareBps": 4000}
            ],
            "terms": {"territory": "worldwide", "rights": ["mechanical", "performance"]},
            "timestamp": 1_700_000_000,
            "nonce": "n1"
        })
    }

    fn sample_intent() -> PublishIntent {
        let key = crate::crypto::ServerKey::from_hex(&hex::encode([0x11u8; 32])).unwrap();
        PublishIntent {
            protocol: PROTOCOL_TAG.into(),
            version: PROTOCOL_VERSION,
            record: sample_record(),
            signer: SignerRef {
                pubkey: key.signer_key(),
            },
            signature: SignatureBlock {
                alg: SIGNATURE_ALG.into(),
                hash: SIGNATURE_HASH.into(),
                sig: "00".into(),
            },
        }
    }

    #[test]
    fn shape_check_accepts_sample() {
        let record = sample_intent().validate_shape().unwrap();
        assert_eq!(record.record_id, "REC-1");
        assert_eq!(record.event_kind, EventKind::Register);
        assert_eq!(record.owners.len(), 2);
    }

    #[test]
    fn shape_check_rejects_wrong_protocol() {
        let mut intent = sample_intent();
        intent.protocol = "other".into();
        assert!(intent.validate_shape().is_err());

        let mut intent = sample_intent();
        intent.version = 2;
        assert!(intent.validate_shape().is_err());
    }

    #[test]
    fn shape_check_rejects_unknown_alg() {
        let mut intent = sample_intent();
        intent.signature.alg = "ed25519".into();
        assert!(intent.validate_shape().is_err());
    }

    #[test]
    fn owners_must_sum_to_full_share() {
        let mut intent = sample_intent();
        intent.record["owners"][0]["shareBps"] = json!(5000);
        let err = intent.validate_shape().unwrap_err();
        assert!(err.to_string().contains("bps"));
    }

    #[test]
    fn empty_owner_table_is_allowed() {
        let mut intent = sample_intent();
        intent.record["owners"] = json!([]);
        assert!(intent.validate_shape().is_ok());
    }

    #[test]
    fn unknown_record_fields_are_tolerated() {
        let mut intent = sample_intent();
        intent.record["x-extension"] = json!({"vendor": "field"});
        assert!(intent.validate_shape().is_ok());
    }

    #[test]
    fn event_kind_wire_names() {
        assert_eq!(
            serde_json::to_value(EventKind::SplitChange).unwrap(),
            json!("SPLIT_CHANGE")
        );
        let kind: EventKind = serde_json::from_value(json!("ASSIGN")).unwrap();
        assert_eq!(kind, EventKind::Assign);
    }

    #[test]
    fn envelope_roundtrips_through_json() {
        let intent = sample_intent();
        let text = serde_json::to_string(&intent).unwrap();
        let back: PublishIntent = serde_json::from_str(&text).unwrap();
        assert_eq!(back.record, intent.record);
        assert_eq!(back.signer.pubkey, intent.signer.pubkey);
    }
}
