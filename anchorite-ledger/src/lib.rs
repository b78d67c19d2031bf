//! Ledger-facing pieces of Anchorite.
//!
//! This crate builds the anchoring transactions and talks to the external
//! ledger's broadcast endpoint. Every anchoring transaction has the same
//! shape:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                     ANCHORING TRANSACTION                      │
//! │                                                                │
//! │  input 0:  one reserved pool UTXO (P2PKH, server key)          │
//! │                                                                │
//! │  output 0: OP_RETURN {"hash":"<64 hex>","p":"sl-drm","v":1}    │
//! │            value 0, non-spendable                              │
//! │  output 1: change to the configured change address             │
//! │                                                                │
//! │  fee = virtual size × fee rate (sats/KB)                       │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Input signing uses RFC 6979 deterministic nonces, so retrying a build
//! against the same UTXO reproduces byte-identical raw bytes and the same
//! txid. That is what lets the broadcast adapter treat a duplicate
//! submission as benign mempool-conflict bookkeeping rather than a double
//! spend.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod broadcast;
pub mod config;
pub mod error;
pub mod tx;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use broadcast::{Broadcaster, BroadcastOutcome, HttpBroadcaster};
pub use config::{LedgerConfig, Network};
pub use error::{LedgerError, Result};
pub use tx::{
    build_anchor_script, build_anchor_tx, build_split_tx, parse_anchor_script, server_address,
    AnchorPayload, BuiltTx, SpendableInput, SplitPlan, SplitTx,
};

#[cfg(any(test, feature = "mock"))]
pub use mock::MockBroadcaster;

/// Maximum data-carrier payload accepted by the target ledger.
pub const MAX_DATA_CARRIER_SIZE: usize = 220;

/// Default broadcast timeout in seconds.
pub const DEFAULT_BROADCAST_TIMEOUT_SECS: u64 = 30;
