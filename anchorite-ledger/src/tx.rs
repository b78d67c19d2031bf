//! Anchoring and split transaction building.
//!
//! Pool inputs always pay the server key's P2PKH script; building validates
//! this before signing so a mis-seeded pool fails loudly instead of
//! producing an unspendable transaction.

use bitcoin::blockdata::opcodes;
use bitcoin::blockdata::script::{Builder, PushBytesBuf, ScriptBuf};
use bitcoin::hashes::Hash as _;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    absolute, transaction, Address, Amount, OutPoint, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use serde::{Deserialize, Serialize};

use anchorite_core::{canonicalize, RecordHash, ServerKey, PROTOCOL_TAG, PROTOCOL_VERSION};

use crate::config::Network;
use crate::error::{LedgerError, Result};
use crate::MAX_DATA_CARRIER_SIZE;

/// The on-ledger payload carried by every anchoring output.
///
/// Serialized in canonical form, the wire bytes are exactly
/// `{"hash":"<64 lowercase hex>","p":"sl-drm","v":1}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorPayload {
    /// Protocol tag.
    pub p: String,
    /// Protocol version.
    pub v: u32,
    /// Record hash, lowercase hex.
    pub hash: String,
}

impl AnchorPayload {
    /// Build the payload for a record hash.
    pub fn new(hash: &RecordHash) -> Self {
        Self {
            p: PROTOCOL_TAG.to_string(),
            v: PROTOCOL_VERSION,
            hash: hash.to_hex(),
        }
    }

    /// The canonical payload bytes embedded in the data-carrier script.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let value = serde_json::to_value(self).expect("payload always serializes");
        canonicalize(&value)
    }
}

/// A pool input as handed out by the reservation engine.
#[derive(Debug, Clone)]
pub struct SpendableInput {
    /// Ledger transaction id, display-order hex.
    pub txid: String,
    /// Output index.
    pub vout: u32,
    /// Value in satoshis.
    pub satoshis: u64,
    /// Locking script, hex.
    pub script_pubkey: String,
}

/// A fully built, signed transaction ready for broadcast.
#[derive(Debug, Clone)]
pub struct BuiltTx {
    /// Serialized transaction, hex.
    pub raw_hex: String,
    /// Transaction id, display-order hex.
    pub txid: String,
    /// Virtual size in vbytes.
    pub vsize: usize,
    /// Fee paid in satoshis.
    pub fee: u64,
}

/// Inputs to a pool split.
#[derive(Debug, Clone)]
pub struct SplitPlan {
    /// The funding/change input to split.
    pub source: SpendableInput,
    /// Denomination of each new publish input.
    pub unit_value: u64,
    /// How many publish inputs to mint.
    pub unit_count: u32,
    /// Fee rate in sats/KB.
    pub fee_rate_sats_per_kb: u64,
}

/// A built split transaction plus the layout of its outputs, which the
/// replenisher turns into new pool rows after broadcast.
#[derive(Debug, Clone)]
pub struct SplitTx {
    /// The signed transaction.
    pub built: BuiltTx,
    /// How many unit outputs were minted (vouts `0..unit_count`).
    pub unit_count: u32,
    /// Denomination of each unit output.
    pub unit_value: u64,
    /// Locking script of the unit outputs, hex.
    pub unit_script_hex: String,
    /// Address of the unit outputs.
    pub unit_address: String,
    /// Output index of the change output.
    pub change_vout: u32,
    /// Change value in satoshis.
    pub change_value: u64,
    /// Locking script of the change output, hex.
    pub change_script_hex: String,
    /// Address of the change output.
    pub change_address: String,
}

/// Build the data-carrier script for a record hash.
///
/// Format: `OP_RETURN <canonical payload JSON>`.
pub fn build_anchor_script(hash: &RecordHash) -> Result<ScriptBuf> {
    let data = AnchorPayload::new(hash).canonical_bytes();

    if data.len() > MAX_DATA_CARRIER_SIZE {
        return Err(LedgerError::PayloadTooLarge {
            len: data.len(),
            max: MAX_DATA_CARRIER_SIZE,
        });
    }

    let push_bytes =
        PushBytesBuf::try_from(data).map_err(|e| LedgerError::TxBuild(e.to_string()))?;

    Ok(Builder::new()
        .push_opcode(opcodes::all::OP_RETURN)
        .push_slice(push_bytes)
        .into_script())
}

/// Parse a data-carrier script back into its payload.
pub fn parse_anchor_script(script: &ScriptBuf) -> Result<AnchorPayload> {
    let bytes = script.as_bytes();

    if bytes.is_empty() || bytes[0] != opcodes::all::OP_RETURN.to_u8() {
        return Err(LedgerError::InvalidScript("not a data-carrier script".into()));
    }

    // Skip OP_RETURN and the push opcode.
    let data = if bytes.len() > 2 && bytes[1] <= 75 {
        &bytes[2..]
    } else if bytes.len() > 3 && bytes[1] == opcodes::all::OP_PUSHDATA1.to_u8() {
        &bytes[3..]
    } else {
        return Err(LedgerError::InvalidScript("unexpected push format".into()));
    };

    let payload: AnchorPayload = serde_json::from_slice(data)
        .map_err(|e| LedgerError::InvalidScript(format!("payload is not valid JSON: {e}")))?;

    if payload.p != PROTOCOL_TAG {
        return Err(LedgerError::InvalidScript(format!(
            "unknown protocol tag {:?}",
            payload.p
        )));
    }
    if payload.v != PROTOCOL_VERSION {
        return Err(LedgerError::InvalidScript(format!(
            "unsupported version {}",
            payload.v
        )));
    }

    Ok(payload)
}

/// The server key's P2PKH address on `network`; pool inputs pay here.
pub fn server_address(key: &ServerKey, network: Network) -> Address {
    let pubkey = bitcoin::PublicKey::new(key.public_key());
    Address::p2pkh(&pubkey, network.to_bitcoin_network())
}

/// Estimated serialized size of a signed 1-input P2PKH transaction.
///
/// version(4) + locktime(4) + counts(2) + input(148 with a 107-byte
/// scriptSig) + each output's value(8) + script length prefix + script.
fn estimated_size(output_script_lens: &[usize]) -> usize {
    let outputs: usize = output_script_lens.iter().map(|len| 8 + 1 + len).sum();
    4 + 4 + 2 + 148 + outputs
}

fn fee_for(vsize: usize, sats_per_kb: u64) -> u64 {
    (vsize as u64 * sats_per_kb).div_ceil(1000)
}

const P2PKH_SCRIPT_LEN: usize = 25;

fn parse_outpoint(input: &SpendableInput) -> Result<OutPoint> {
    let txid: Txid = input
        .txid
        .parse()
        .map_err(|e| LedgerError::TxBuild(format!("bad input txid: {e}")))?;
    Ok(OutPoint {
        txid,
        vout: input.vout,
    })
}

/// Sign input 0 of `tx` with the server key against `script_pubkey`.
fn sign_input(tx: &mut Transaction, script_pubkey: &ScriptBuf, key: &ServerKey) -> Result<()> {
    // Refuse to sign inputs the key cannot actually spend.
    let expected = ScriptBuf::new_p2pkh(&bitcoin::PublicKey::new(key.public_key()).pubkey_hash());
    if *script_pubkey != expected {
        return Err(LedgerError::Signing(
            "input does not pay the server key".into(),
        ));
    }

    let sighash = SighashCache::new(&*tx)
        .legacy_signature_hash(0, script_pubkey, EcdsaSighashType::All.to_u32())
        .map_err(|e| LedgerError::Signing(e.to_string()))?;

    let signature = key.sign_digest(&sighash.to_byte_array());

    let mut sig_bytes = signature.serialize_der().to_vec();
    sig_bytes.push(EcdsaSighashType::All.to_u32() as u8);

    let sig_push =
        PushBytesBuf::try_from(sig_bytes).map_err(|e| LedgerError::Signing(e.to_string()))?;
    let key_push = PushBytesBuf::try_from(key.public_key().serialize().to_vec())
        .map_err(|e| LedgerError::Signing(e.to_string()))?;

    tx.input[0].script_sig = Builder::new()
        .push_slice(sig_push)
        .push_slice(key_push)
        .into_script();
    Ok(())
}

fn unsigned_tx(outpoint: OutPoint, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: outputs,
    }
}

/// Build and sign an anchoring transaction.
///
/// One input (the reserved UTXO), one zero-value data-carrier output, one
/// change output. Deterministic: identical inputs produce identical bytes,
/// so a retry on the same UTXO has the same txid.
pub fn build_anchor_tx(
    input: &SpendableInput,
    hash: &RecordHash,
    change_address: &str,
    key: &ServerKey,
    fee_rate_sats_per_kb: u64,
    network: Network,
) -> Result<BuiltTx> {
    let anchor_script = build_anchor_script(hash)?;

    let change_script = change_address
        .parse::<Address<bitcoin::address::NetworkUnchecked>>()?
        .require_network(network.to_bitcoin_network())
        .map_err(|e| LedgerError::InvalidAddress(e.to_string()))?
        .script_pubkey();

    let vsize = estimated_size(&[anchor_script.len(), change_script.len()]);
    let fee = fee_for(vsize, fee_rate_sats_per_kb);

    // The change output must exist per the wire contract, so the input has
    // to cover at least one satoshi over the fee.
    if input.satoshis <= fee {
        return Err(LedgerError::InsufficientValue {
            need: fee + 1,
            have: input.satoshis,
        });
    }
    let change = input.satoshis - fee;

    let script_pubkey = ScriptBuf::from_bytes(hex::decode(&input.script_pubkey)?);
    let outpoint = parse_outpoint(input)?;

    let mut tx = unsigned_tx(
        outpoint,
        vec![
            TxOut {
                value: Amount::ZERO,
                script_pubkey: anchor_script,
            },
            TxOut {
                value: Amount::from_sat(change),
                script_pubkey: change_script,
            },
        ],
    );

    sign_input(&mut tx, &script_pubkey, key)?;

    Ok(BuiltTx {
        raw_hex: bitcoin::consensus::encode::serialize_hex(&tx),
        txid: tx.compute_txid().to_string(),
        vsize: tx.vsize(),
        fee,
    })
}

/// Build and sign a pool split transaction: one funding/change input fanned
/// out into `unit_count` publish outputs plus one change output, all paying
/// the server key's address.
pub fn build_split_tx(plan: &SplitPlan, key: &ServerKey, network: Network) -> Result<SplitTx> {
    if plan.unit_count == 0 {
        return Err(LedgerError::TxBuild("split of zero outputs".into()));
    }

    let address = server_address(key, network);
    let unit_script = address.script_pubkey();

    let script_lens: Vec<usize> = std::iter::repeat(P2PKH_SCRIPT_LEN)
        .take(plan.unit_count as usize + 1)
        .collect();
    let vsize = estimated_size(&script_lens);
    let fee = fee_for(vsize, plan.fee_rate_sats_per_kb);

    let minted = plan.unit_value * plan.unit_count as u64;
    let need = minted + fee + 1;
    if plan.source.satoshis < need {
        return Err(LedgerError::InsufficientValue {
            need,
            have: plan.source.satoshis,
        });
    }
    let change = plan.source.satoshis - minted - fee;

    let mut outputs: Vec<TxOut> = (0..plan.unit_count)
        .map(|_| TxOut {
            value: Amount::from_sat(plan.unit_value),
            script_pubkey: unit_script.clone(),
        })
        .collect();
    outputs.push(TxOut {
        value: Amount::from_sat(change),
        script_pubkey: unit_script.clone(),
    });

    let script_pubkey = ScriptBuf::from_bytes(hex::decode(&plan.source.script_pubkey)?);
    let outpoint = parse_outpoint(&plan.source)?;

    let mut tx = unsigned_tx(outpoint, outputs);
    sign_input(&mut tx, &script_pubkey, key)?;

    let script_hex = hex::encode(unit_script.as_bytes());
    Ok(SplitTx {
        built: BuiltTx {
            raw_hex: bitcoin::consensus::encode::serialize_hex(&tx),
            txid: tx.compute_txid().to_string(),
            vsize: tx.vsize(),
            fee,
        },
        unit_count: plan.unit_count,
        unit_value: plan.unit_value,
        unit_script_hex: script_hex.clone(),
        unit_address: address.to_string(),
        change_vout: plan.unit_count,
        change_value: change,
        change_script_hex: script_hex,
        change_address: address.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_key() -> ServerKey {
        ServerKey::from_hex(&hex::encode([0x42u8; 32])).unwrap()
    }

    fn test_hash() -> RecordHash {
        anchorite_core::record_hash(&json!({"recordId": "REC-1"}))
    }

    fn pool_input(key: &ServerKey, sats: u64) -> SpendableInput {
        let script = server_address(key, Network::Regtest).script_pubkey();
        SpendableInput {
            txid: "aa".repeat(32),
            vout: 0,
            satoshis: sats,
            script_pubkey: hex::encode(script.as_bytes()),
        }
    }

    #[test]
    fn payload_is_bit_exact() {
        let hash = test_hash();
        let bytes = AnchorPayload::new(&hash).canonical_bytes();
        let expected = format!(r#"{{"hash":"{}","p":"sl-drm","v":1}}"#, hash.to_hex());
        assert_eq!(String::from_utf8(bytes).unwrap(), expected);
    }

    #[test]
    fn anchor_script_roundtrip() {
        let hash = test_hash();
        let script = build_anchor_script(&hash).unwrap();
        assert!(script.is_op_return());

        let payload = parse_anchor_script(&script).unwrap();
        assert_eq!(payload.hash, hash.to_hex());
        assert_eq!(payload.p, "sl-drm");
        assert_eq!(payload.v, 1);
    }

    #[test]
    fn parse_rejects_foreign_scripts() {
        let script = ScriptBuf::from_bytes(vec![0x51]); // OP_1
        assert!(parse_anchor_script(&script).is_err());
    }

    #[test]
    fn anchor_tx_shape() {
        let key = test_key();
        let change = server_address(&key, Network::Regtest).to_string();
        let input = pool_input(&key, 100_000);

        let built = build_anchor_tx(&input, &test_hash(), &change, &key, 100, Network::Regtest)
            .unwrap();

        let tx: Transaction = bitcoin::consensus::encode::deserialize_hex(&built.raw_hex).unwrap();
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.output.len(), 2);
        assert_eq!(tx.output[0].value, Amount::ZERO);
        assert!(tx.output[0].script_pubkey.is_op_return());
        assert_eq!(tx.output[1].value.to_sat(), 100_000 - built.fee);
        assert_eq!(built.txid, tx.compute_txid().to_string());
    }

    #[test]
    fn anchor_tx_is_deterministic() {
        let key = test_key();
        let change = server_address(&key, Network::Regtest).to_string();
        let input = pool_input(&key, 100_000);
        let hash = test_hash();

        let a = build_anchor_tx(&input, &hash, &change, &key, 100, Network::Regtest).unwrap();
        let b = build_anchor_tx(&input, &hash, &change, &key, 100, Network::Regtest).unwrap();
        assert_eq!(a.raw_hex, b.raw_hex);
        assert_eq!(a.txid, b.txid);
    }

    #[test]
    fn anchor_tx_requires_fee_coverage() {
        let key = test_key();
        let change = server_address(&key, Network::Regtest).to_string();
        let input = pool_input(&key, 10);

        let err = build_anchor_tx(&input, &test_hash(), &change, &key, 100, Network::Regtest)
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientValue { .. }));
    }

    #[test]
    fn refuses_foreign_input_script() {
        let key = test_key();
        let other = ServerKey::from_hex(&hex::encode([0x43u8; 32])).unwrap();
        let change = server_address(&key, Network::Regtest).to_string();
        // Input pays the other key.
        let input = pool_input(&other, 100_000);

        let err = build_anchor_tx(&input, &test_hash(), &change, &key, 100, Network::Regtest)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Signing(_)));
    }

    #[test]
    fn split_tx_fan_out() {
        let key = test_key();
        let plan = SplitPlan {
            source: pool_input(&key, 10_000_000),
            unit_value: 100,
            unit_count: 1000,
            fee_rate_sats_per_kb: 100,
        };

        let split = build_split_tx(&plan, &key, Network::Regtest).unwrap();
        let tx: Transaction =
            bitcoin::consensus::encode::deserialize_hex(&split.built.raw_hex).unwrap();

        assert_eq!(tx.output.len(), 1001);
        assert!(tx.output[..1000]
            .iter()
            .all(|out| out.value.to_sat() == 100));
        assert_eq!(split.change_vout, 1000);
        assert_eq!(
            tx.output[1000].value.to_sat(),
            10_000_000 - 100 * 1000 - split.built.fee
        );
    }

    #[test]
    fn split_tx_requires_capacity() {
        let key = test_key();
        let plan = SplitPlan {
            source: pool_input(&key, 1_000),
            unit_value: 100,
            unit_count: 1000,
            fee_rate_sats_per_kb: 100,
        };
        assert!(matches!(
            build_split_tx(&plan, &key, Network::Regtest),
            Err(LedgerError::InsufficientValue { .. })
        ));
    }
}
