//! The three send paths under measurement, behind one trait so the worker
//! loop is strategy-agnostic. Copying and vectored are stateless syscall
//! substitutions; the deferred path (zerocopy module) carries real state.

use std::io::{self, IoSlice, Write};
use std::net::TcpStream;

use crate::buffer::AlignedBuf;
use crate::config::Strategy;
use crate::error::{Error, Result};
use crate::message::{frame_size, Message};

pub mod zerocopy;

pub use zerocopy::DeferredSender;

/// One per-connection transmission strategy instance. The frame is prepared
/// once at construction; `send_frame` pushes one copy of it down the socket.
pub trait Transmitter: Send {
    /// Transmit one full frame. Transient conditions are retried internally;
    /// anything returned here is fatal for the connection.
    fn send_frame(&mut self) -> Result<usize>;

    /// Called once after the send loop ends. The deferred strategy drains its
    /// outstanding completions here; the others have nothing to do.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    fn frame_len(&self) -> usize;
}

/// Build the configured strategy for a freshly connected stream.
pub fn build(strategy: Strategy, stream: TcpStream, message: &Message) -> Result<Box<dyn Transmitter>> {
    Ok(match strategy {
        Strategy::Copying => Box::new(CopySender::new(stream, message)?),
        Strategy::Vectored => Box::new(VectoredSender::new(stream, message)?),
        Strategy::Deferred => Box::new(DeferredSender::new(stream, message)?),
    })
}

/// Interrupted and would-block are retried in place, never surfaced.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

/// Two-copy baseline: one blocking `write` of the whole frame from an
/// ordinary heap buffer.
pub struct CopySender {
    stream: TcpStream,
    frame: Vec<u8>,
}

impl CopySender {
    pub fn new(stream: TcpStream, message: &Message) -> Result<Self> {
        let mut frame = vec![0u8; frame_size(message.field_size())];
        message.serialize(&mut frame)?;
        Ok(Self { stream, frame })
    }
}

impl Transmitter for CopySender {
    fn send_frame(&mut self) -> Result<usize> {
        loop {
            match self.stream.write(&self.frame) {
                Ok(sent) if sent == self.frame.len() => return Ok(sent),
                // No partial-frame continuation exists; a short write is
                // fatal for this connection.
                Ok(sent) => {
                    return Err(Error::ShortWrite {
                        sent,
                        expected: self.frame.len(),
                    })
                }
                Err(e) if is_transient(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn frame_len(&self) -> usize {
        self.frame.len()
    }
}

/// Vectored send from a page-aligned region. A single segment describes the
/// pre-serialized frame; the win comes from the aligned, DMA-friendly source
/// buffer, not from multi-segment gathering.
pub struct VectoredSender {
    stream: TcpStream,
    buf: AlignedBuf,
    frame_len: usize,
}

impl VectoredSender {
    pub fn new(stream: TcpStream, message: &Message) -> Result<Self> {
        let frame_len = frame_size(message.field_size());
        let mut buf = AlignedBuf::new(frame_len)?;
        message.serialize(&mut buf)?;
        Ok(Self {
            stream,
            buf,
            frame_len,
        })
    }
}

impl Transmitter for VectoredSender {
    fn send_frame(&mut self) -> Result<usize> {
        let segment = IoSlice::new(&self.buf[..self.frame_len]);
        loop {
            match self.stream.write_vectored(&[segment]) {
                Ok(sent) if sent == self.frame_len => return Ok(sent),
                Ok(sent) => {
                    return Err(Error::ShortWrite {
                        sent,
                        expected: self.frame_len,
                    })
                }
                Err(e) if is_transient(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn frame_len(&self) -> usize {
        self.frame_len
    }
}
