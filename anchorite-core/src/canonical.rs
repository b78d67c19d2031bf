//! Deterministic JSON canonicalization and record hashing.
//!
//! The canonical form is the byte-exact encoding that the record hash (and
//! therefore the signature and the on-ledger payload) are computed over:
//!
//! - Object keys sorted by Unicode code point, ascending
//! - Arrays order-preserving
//! - No insignificant whitespace
//! - Minimal number/string encoding (standard JSON escaping)
//! - UTF-8 encoded
//!
//! Canonicalization applies to the `record` subtree of an envelope only,
//! never to the signed wrapper around it.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

/// Produce the canonical byte encoding of a JSON value.
///
/// Two structurally equal values always canonicalize to identical bytes;
/// this is the property every downstream identity (record hash, idempotent
/// admission, ledger payload) rests on.
pub fn canonicalize(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => {
            // serde_json already renders the minimal decimal form.
            out.extend_from_slice(n.to_string().as_bytes());
        }
        Value::String(s) => write_json_string(s, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            // &str ordering is byte order over UTF-8, i.e. code-point order.
            keys.sort_unstable();

            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_json_string(key, out);
                out.push(b':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push(b'}');
        }
    }
}

fn write_json_string(s: &str, out: &mut Vec<u8>) {
    serde_json::to_writer(&mut *out, s).expect("writing to a Vec cannot fail");
}

/// Compute the SHA-256 record hash over the canonical encoding of `value`.
pub fn record_hash(value: &Value) -> RecordHash {
    let canonical = canonicalize(value);
    RecordHash::digest(&canonical)
}

/// Compute the record hash used for anchoring and idempotent admission.
///
/// The top-level `nonce` is replay salt, not content: stripping it before
/// hashing is what makes a resubmission of the same body under a fresh nonce
/// collapse onto the original job instead of anchoring the same content
/// twice. Everything else in the record, including the timestamp,
/// participates.
pub fn content_hash(record: &Value) -> RecordHash {
    match record {
        Value::Object(map) => {
            let mut stripped = map.clone();
            stripped.remove("nonce");
            record_hash(&Value::Object(stripped))
        }
        other => record_hash(other),
    }
}

/// The 32-byte SHA-256 fingerprint of a canonical record body.
///
/// Displayed and persisted as 64 lowercase hex characters. Globally unique
/// across jobs; it is the idempotency key for admission.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordHash([u8; 32]);

impl RecordHash {
    /// Create a record hash from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash arbitrary bytes with SHA-256.
    pub fn digest(data: &[u8]) -> Self {
        let out = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&out);
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from a 64-character lowercase hex string.
    pub fn from_hex(s: &str) -> CoreResult<Self> {
        let bytes = hex::decode(s).map_err(|e| CoreError::InvalidHash(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(CoreError::InvalidHash(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Convert to lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for RecordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for RecordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for RecordHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for RecordHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RecordHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn key_order_is_code_point_ascending() {
        let value = json!({"z": 1, "a": 2, "m": [3, {"y": 4, "b": 5}]});
        let bytes = canonicalize(&value);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":2,"m":[3,{"b":5,"y":4}],"z":1}"#
        );
    }

    #[test]
    fn structurally_equal_values_share_bytes() {
        let a = json!({"recordId": "REC-1", "owners": [{"party": "p1", "shareBps": 10000}]});
        let b: Value =
            serde_json::from_str(r#"{ "owners": [ {"shareBps": 10000, "party": "p1"} ], "recordId": "REC-1" }"#)
                .unwrap();
        assert_eq!(canonicalize(&a), canonicalize(&b));
        assert_eq!(record_hash(&a), record_hash(&b));
    }

    #[test]
    fn arrays_preserve_order() {
        let a = json!([1, 2, 3]);
        let b = json!([3, 2, 1]);
        assert_ne!(canonicalize(&a), canonicalize(&b));
    }

    #[test]
    fn strings_escape_minimally() {
        let value = json!({"k": "a\"b\\c\nd"});
        let bytes = canonicalize(&value);
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"k":"a\"b\\c\nd"}"#);
    }

    #[test]
    fn content_hash_ignores_only_the_nonce() {
        let a = json!({"recordId": "REC-1", "timestamp": 100, "nonce": "n1"});
        let b = json!({"recordId": "REC-1", "timestamp": 100, "nonce": "n2"});
        let c = json!({"recordId": "REC-1", "timestamp": 101, "nonce": "n1"});

        assert_eq!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&c));
        // Full-record hashes still differ when the nonce does.
        assert_ne!(record_hash(&a), record_hash(&b));
    }

    #[test]
    fn hash_is_lowercase_hex() {
        let h = record_hash(&json!({"x": 1}));
        let hex = h.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(RecordHash::from_hex(&hex).unwrap(), h);
    }

    #[test]
    fn hash_rejects_bad_hex() {
        assert!(RecordHash::from_hex("zz").is_err());
        assert!(RecordHash::from_hex("abcd").is_err());
    }

    #[test]
    fn known_digest() {
        // SHA-256 of the canonical bytes of {} is the digest of "{}".
        let h = record_hash(&json!({}));
        assert_eq!(
            h.to_hex(),
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    fn arb_json(depth: u32) -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-zA-Z0-9 _\\-]{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(depth, 64, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,8}", inner, 0..6)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn canonicalization_is_idempotent(value in arb_json(3)) {
            let once = canonicalize(&value);
            let reparsed: Value = serde_json::from_slice(&once).unwrap();
            let twice = canonicalize(&reparsed);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn canonical_bytes_parse_back(value in arb_json(3)) {
            let bytes = canonicalize(&value);
            let reparsed: Value = serde_json::from_slice(&bytes).unwrap();
            prop_assert_eq!(value, reparsed);
        }
    }
}
