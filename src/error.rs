use std::io;

/// Failure taxonomy for the transmission core.
///
/// Transient conditions (EINTR, EWOULDBLOCK, ENOBUFS) are retried inside the
/// strategies and never show up here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("buffer too small: need {needed} bytes, have {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("truncated frame: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("aligned allocation of {size} bytes failed")]
    AllocationFailed { size: usize },

    #[error("short write: sent {sent} of {expected} bytes")]
    ShortWrite { sent: usize, expected: usize },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("completion drain timed out with {outstanding} sends unresolved")]
    DrainTimeout { outstanding: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
