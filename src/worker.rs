use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::message::{frame_size, frame_size_checked, Message, LEN_PREFIX};
use crate::stats::{LocalStats, StatsAggregator};
use crate::strategy::Transmitter;

/// Process-wide cancellation flag: set once, polled by every worker loop.
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How long a blocked receiver read may sit before re-checking the token.
const RECEIVE_POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Drive one connection's send loop until the deadline or shutdown, timing
/// each transmit call. Local counters fold into the aggregator exactly once,
/// on exit, whether or not the loop ended in an error.
pub fn run_sender(
    worker_id: usize,
    mut tx: Box<dyn Transmitter>,
    deadline: Instant,
    token: &ShutdownToken,
    aggregator: &StatsAggregator,
) -> Result<()> {
    let mut local = LocalStats::default();
    let frame_len = tx.frame_len();
    debug!(worker_id, frame_len, "sender loop starting");

    let mut loop_result = Ok(());
    while Instant::now() < deadline && !token.is_set() {
        let start = Instant::now();
        match tx.send_frame() {
            Ok(sent) => local.record(sent, start.elapsed()),
            Err(e) => {
                loop_result = Err(e);
                break;
            }
        }
    }

    // Drain before anything else: a deferred sender must not release its
    // buffer while completions are pending.
    let drain_result = tx.finish();
    aggregator.fold(&local);
    debug!(
        worker_id,
        messages = local.total_messages,
        bytes = local.total_bytes,
        "sender loop done"
    );

    loop_result?;
    match drain_result {
        // The experiment's numbers are unaffected; the buffer was leaked and
        // the connection still closes.
        Err(Error::DrainTimeout { outstanding }) => {
            warn!(
                worker_id,
                outstanding, "kernel never confirmed all sends; leaked the send buffer"
            );
            Ok(())
        }
        other => other,
    }
}

enum FrameStep {
    Received(usize),
    Eof,
    Poll,
}

/// Drive one connection's receive loop: read frames, validate the declared
/// size against the receive buffer, deserialize, count. Ends on clean EOF at
/// a frame boundary, the deadline, or shutdown; mid-frame EOF is a protocol
/// violation surfaced as `Truncated`.
pub fn run_receiver(
    worker_id: usize,
    stream: TcpStream,
    expected_field_size: usize,
    deadline: Instant,
    token: &ShutdownToken,
    aggregator: &StatsAggregator,
) -> Result<()> {
    let mut stream = stream;
    stream.set_read_timeout(Some(RECEIVE_POLL_TIMEOUT))?;

    let capacity = frame_size(expected_field_size);
    let mut buf = vec![0u8; capacity];
    let mut local = LocalStats::default();
    debug!(worker_id, capacity, "receiver loop starting");

    let mut loop_result = Ok(());
    while Instant::now() < deadline && !token.is_set() {
        let start = Instant::now();
        match read_frame(&mut stream, &mut buf, deadline) {
            Ok(FrameStep::Received(total)) => match Message::deserialize(&buf[..total]) {
                Ok(_) => local.record(total, start.elapsed()),
                Err(e) => {
                    loop_result = Err(e);
                    break;
                }
            },
            Ok(FrameStep::Eof) => break,
            Ok(FrameStep::Poll) => continue,
            Err(e) => {
                loop_result = Err(e);
                break;
            }
        }
    }

    aggregator.fold(&local);
    debug!(
        worker_id,
        messages = local.total_messages,
        bytes = local.total_bytes,
        "receiver loop done"
    );
    loop_result
}

/// Read one whole frame into `buf`. The length prefix is read first so the
/// declared size can be validated before committing to the body. A peer that
/// stalls mid-frame past the deadline is reported as truncation, not waited
/// on forever.
fn read_frame(stream: &mut TcpStream, buf: &mut [u8], deadline: Instant) -> Result<FrameStep> {
    let mut read = 0usize;
    while read < LEN_PREFIX {
        match stream.read(&mut buf[read..LEN_PREFIX]) {
            Ok(0) if read == 0 => return Ok(FrameStep::Eof),
            Ok(0) => {
                return Err(Error::Truncated {
                    needed: LEN_PREFIX,
                    got: read,
                })
            }
            Ok(n) => read += n,
            Err(e) if is_poll_timeout(&e) => {
                if read == 0 {
                    return Ok(FrameStep::Poll);
                }
                if Instant::now() >= deadline {
                    return Err(Error::Truncated {
                        needed: LEN_PREFIX,
                        got: read,
                    });
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let mut prefix = [0u8; LEN_PREFIX];
    prefix.copy_from_slice(&buf[..LEN_PREFIX]);
    let declared_field_size = u64::from_le_bytes(prefix) as usize;
    let total = match frame_size_checked(declared_field_size) {
        Some(total) if total <= buf.len() => total,
        _ => {
            return Err(Error::ProtocolViolation(format!(
                "declared field size {} exceeds receive buffer of {} bytes",
                declared_field_size,
                buf.len()
            )))
        }
    };

    while read < total {
        match stream.read(&mut buf[read..total]) {
            Ok(0) => {
                return Err(Error::Truncated {
                    needed: total,
                    got: read,
                })
            }
            Ok(n) => read += n,
            Err(e) if is_poll_timeout(&e) => {
                if Instant::now() >= deadline {
                    return Err(Error::Truncated {
                        needed: total,
                        got: read,
                    });
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(FrameStep::Received(total))
}

fn is_poll_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
