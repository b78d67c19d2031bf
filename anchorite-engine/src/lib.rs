//! The Anchorite processing engine.
//!
//! Everything between the HTTP surface and the ledger lives here:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         ANCHORITE ENGINE                             │
//! │                                                                      │
//! │  intent ──► AdmissionPipeline ──► job store (queued)                 │
//! │                                       │                              │
//! │               ┌───────────────────────┴──────────────┐              │
//! │               ▼                                      ▼              │
//! │         JobWorker (low volume)            BatchCollector (5s window) │
//! │               │                                      │              │
//! │               │                              BatchBroadcaster       │
//! │               │                              (ordered drain,        │
//! │               │                               token bucket)         │
//! │               ▼                                      ▼              │
//! │        UTXO pool ──► tx builder ──► broadcast adapter ──► ledger    │
//! │                                                                      │
//! │  Replenisher: splits funding inputs when the pool runs low          │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every loop is an independent task that observes a shutdown signal
//! between iterations; durability lives in the store, so nothing needs
//! draining on exit.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod admission;
pub mod broadcaster;
pub mod collector;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod replenisher;
pub mod worker;

pub use admission::{AdmissionOutcome, AdmissionPipeline};
pub use broadcaster::{BatchBroadcaster, UnstickSweeper};
pub use collector::BatchCollector;
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use ratelimit::TokenBucket;
pub use replenisher::{ReplenishAction, Replenisher};
pub use worker::JobWorker;
