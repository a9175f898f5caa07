//! Passive NTP client telemetry pipeline.
//!
//! Capture workers pair observed NTP request/response traffic into session
//! records and stream them over persistent TCP to a central ingestion
//! server, which merges them into per-client state in SQLite.

pub mod config;
pub mod pairer;
pub mod record;
pub mod server;
pub mod stats;
pub mod storage;
pub mod transport;
pub mod worker;
pub mod writer;
