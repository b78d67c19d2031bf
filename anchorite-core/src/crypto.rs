//! secp256k1 keys and ECDSA signature verification.
//!
//! Intents are signed by their publishers with ECDSA over secp256k1; the
//! message is always the 32-byte record hash and signatures arrive
//! DER-encoded. The same curve signs the server's ledger transactions, so a
//! single context serves both directions.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use bitcoin::secp256k1::{ecdsa, All, Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CoreError, CoreResult};

fn secp() -> &'static Secp256k1<All> {
    static SECP: OnceLock<Secp256k1<All>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::new)
}

/// A registered signer's compressed secp256k1 public key (33 bytes).
///
/// This is the signer's identity everywhere: in the registry, on nonce rows,
/// and on job rows. Stored and transported as 66 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SignerKey([u8; 33]);

impl SignerKey {
    /// Create from raw compressed-key bytes.
    ///
    /// Validates that the bytes are a point on the curve.
    pub fn from_bytes(bytes: [u8; 33]) -> CoreResult<Self> {
        PublicKey::from_slice(&bytes).map_err(|e| CoreError::InvalidKey(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Parse from 66 hex characters.
    pub fn from_hex(s: &str) -> CoreResult<Self> {
        let bytes = hex::decode(s).map_err(|e| CoreError::InvalidKey(e.to_string()))?;
        if bytes.len() != 33 {
            return Err(CoreError::InvalidKey(format!(
                "expected 33 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 33];
        arr.copy_from_slice(&bytes);
        Self::from_bytes(arr)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }

    /// Convert to lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse into the secp256k1 type for verification.
    pub fn to_public_key(&self) -> CoreResult<PublicKey> {
        PublicKey::from_slice(&self.0).map_err(|e| CoreError::InvalidKey(e.to_string()))
    }
}

impl fmt::Debug for SignerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignerKey({}..)", &self.to_hex()[..12])
    }
}

impl fmt::Display for SignerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for SignerKey {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for SignerKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SignerKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Verify a DER-encoded ECDSA signature over a 32-byte digest.
///
/// Returns `false` for malformed keys or signatures as well as for honest
/// verification failures; callers map either to the same rejection. Low-S
/// normalization is not enforced.
pub fn verify_record_signature(key: &SignerKey, digest: &[u8; 32], der_sig: &[u8]) -> bool {
    let Ok(pubkey) = key.to_public_key() else {
        return false;
    };
    let Ok(signature) = ecdsa::Signature::from_der(der_sig) else {
        return false;
    };
    let message = Message::from_digest(*digest);
    secp().verify_ecdsa(&message, &signature, &pubkey).is_ok()
}

/// The server's transaction-signing key.
///
/// Loaded once from configuration at startup and threaded into the ledger
/// components; never logged, never serialized.
#[derive(Clone)]
pub struct ServerKey {
    secret: SecretKey,
    public: PublicKey,
}

impl ServerKey {
    /// Parse from 64 hex characters of raw secret-key bytes.
    pub fn from_hex(s: &str) -> CoreResult<Self> {
        let bytes = hex::decode(s).map_err(|e| CoreError::InvalidKey(e.to_string()))?;
        let secret =
            SecretKey::from_slice(&bytes).map_err(|e| CoreError::InvalidKey(e.to_string()))?;
        let public = secret.public_key(secp());
        Ok(Self { secret, public })
    }

    /// Create from an existing secret key.
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key(secp());
        Self { secret, public }
    }

    /// The corresponding compressed public key.
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// The public key in Anchorite's wire form.
    pub fn signer_key(&self) -> SignerKey {
        SignerKey(self.public.serialize())
    }

    /// Sign a 32-byte digest, producing a DER-encodable ECDSA signature.
    ///
    /// secp256k1 derives nonces per RFC 6979, so signing the same digest with
    /// the same key always yields the same signature bytes. Retrying a build
    /// against the same UTXO therefore reproduces the same txid, which is
    /// what makes mempool-conflict detection meaningful.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> ecdsa::Signature {
        let message = Message::from_digest(*digest);
        secp().sign_ecdsa(&message, &self.secret)
    }

    /// Access the raw secret key for sighash signing.
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }
}

impl fmt::Debug for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerKey({}..)", &hex::encode(self.public.serialize())[..12])
    }
}
