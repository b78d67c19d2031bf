//! HTTP surface for Anchorite.
//!
//! Endpoints:
//! - `POST /v1/intents` - Submit a publishing intent
//! - `GET /v1/jobs/{id}` - Job state by job id
//! - `GET /v1/records/{id}` - Latest job for a record id, plus the stored
//!   canonical body
//! - `GET /v1/pool` - Pool depth counters
//! - `GET /v1/health` - Liveness probe (round-trips the job store)
//!
//! Rejections map to HTTP statuses per the error taxonomy: schema, timestamp
//! and signature failures are 400, replays are 409, unknown signers are 403.
//! A duplicate record body is not an error; the prior job is returned with
//! 200.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod rest;
pub mod server;

pub use rest::{IntentResponse, JobResponse, PoolResponse, RecordResponse};
pub use server::{ApiConfig, ApiServer, ApiState};
