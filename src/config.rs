use std::net::SocketAddr;
use std::time::Duration;

use clap::ValueEnum;

use crate::message::NUM_FIELDS;

/// Which send path the experiment exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Strategy {
    /// Plain blocking `write` from a heap buffer (two-copy baseline).
    Copying,
    /// `write_vectored` from a page-aligned buffer.
    Vectored,
    /// `sendmsg(MSG_ZEROCOPY)` with error-queue completion tracking.
    Deferred,
}

impl Strategy {
    pub fn label(self) -> &'static str {
        match self {
            Strategy::Copying => "copying",
            Strategy::Vectored => "vectored",
            Strategy::Deferred => "deferred",
        }
    }
}

/// Resolved run configuration, produced by the CLI layer.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address (server) or target address (client).
    pub endpoint: SocketAddr,
    /// Length of each message field in bytes.
    pub field_size: usize,
    /// How long each worker keeps sending.
    pub duration: Duration,
    /// Number of client sender threads.
    pub threads: usize,
    pub strategy: Strategy,
}

impl Config {
    /// Derive the per-field size from a total payload size, as the experiment
    /// parameters express it (payload is split evenly over the fields).
    pub fn field_size_from_msgsize(msgsize: usize) -> usize {
        (msgsize / NUM_FIELDS).max(1)
    }
}
