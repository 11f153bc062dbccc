//! sendbench: measures three TCP send paths against each other: a copying
//! baseline, a vectored send from page-aligned buffers, and the deferred
//! `MSG_ZEROCOPY` path with error-queue completion tracking.
//!
//! The client sends fixed-format frames with the configured strategy; the
//! server sinks and validates them. Both sides fold per-connection counters
//! into one aggregator and report throughput and average per-call latency.

pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod net;
pub mod server;
pub mod stats;
pub mod strategy;
pub mod worker;

pub use config::{Config, Strategy};
pub use error::Error;
pub use stats::Report;
pub use worker::ShutdownToken;
