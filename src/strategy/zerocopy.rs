//! Deferred (zero-copy) transmission. `sendmsg(MSG_ZEROCOPY)` returns before
//! the kernel is done reading the pinned user pages, so every send is tracked
//! by sequence id until the error-queue notification confirming it arrives.

use std::collections::BTreeSet;
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{is_transient, Transmitter};
use crate::buffer::AlignedBuf;
use crate::error::{Error, Result};
use crate::message::{frame_size, Message};

/// Total time `finish` will wait for the kernel to confirm outstanding sends.
pub const DRAIN_BUDGET: Duration = Duration::from_secs(5);

/// Sleep between empty drain polls.
const DRAIN_POLL_SLEEP: Duration = Duration::from_millis(1);

/// Drain opportunistically every this many sends so pinned pages and queued
/// notifications stay bounded during the hot loop.
const DRAIN_INTERVAL: u64 = 64;

/// How a probed connection transmits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroCopyMode {
    /// `SO_ZEROCOPY` accepted: sends carry `MSG_ZEROCOPY` and each one must
    /// be confirmed through the error queue before the buffer dies.
    Active,
    /// Kernel rejected the option: plain `sendmsg`, nothing to track.
    Fallback,
}

/// Outstanding-send bookkeeping for one connection.
///
/// Sequence ids are issued monotonically from zero, mirroring the kernel's
/// per-socket zerocopy counter, and resolved by inclusive `[lo, hi]`
/// notification ranges. An id resolves exactly once; a range touching an
/// unissued or already-resolved id is a protocol violation.
#[derive(Debug, Default)]
pub struct CompletionTracker {
    next_seq: u32,
    outstanding: BTreeSet<u32>,
    resolved: u64,
    copied: u64,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one issued send and return its sequence id. The counter wraps
    /// at `u32::MAX`, matching the kernel's per-socket zerocopy counter.
    pub fn issue(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.outstanding.insert(seq);
        seq
    }

    /// Resolve the inclusive notification range `[lo, hi]`. `copied` flags a
    /// kernel fallback to copying, which is informational only. Returns how
    /// many ids were resolved.
    pub fn resolve_range(&mut self, lo: u32, hi: u32, copied: bool) -> Result<u32> {
        if lo > hi {
            return Err(Error::ProtocolViolation(format!(
                "inverted completion range [{}, {}]",
                lo, hi
            )));
        }
        if hi >= self.next_seq {
            return Err(Error::ProtocolViolation(format!(
                "completion range [{}, {}] references unissued ids (next issue is {})",
                lo, hi, self.next_seq
            )));
        }
        // Validate the whole range before mutating so a bad notification
        // cannot half-apply.
        for seq in lo..=hi {
            if !self.outstanding.contains(&seq) {
                return Err(Error::ProtocolViolation(format!(
                    "completion range [{}, {}] resolves id {} twice",
                    lo, hi, seq
                )));
            }
        }
        for seq in lo..=hi {
            self.outstanding.remove(&seq);
        }
        let count = hi - lo + 1;
        self.resolved += u64::from(count);
        if copied {
            self.copied += u64::from(count);
        }
        Ok(count)
    }

    /// Number of sends issued so far.
    pub fn issued(&self) -> u64 {
        u64::from(self.next_seq)
    }

    /// Number of sends awaiting confirmation.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Number of confirmed sends.
    pub fn resolved(&self) -> u64 {
        self.resolved
    }

    /// Confirmed sends where the kernel copied instead of pinning.
    pub fn copied(&self) -> u64 {
        self.copied
    }
}

/// The deferred strategy: probes `SO_ZEROCOPY` at construction, issues
/// tracked sends while Active, and refuses to release its buffer until every
/// outstanding send is confirmed (or the drain budget runs out, in which case
/// the buffer is deliberately leaked).
pub struct DeferredSender {
    stream: TcpStream,
    /// `None` only after a drain timeout has leaked the region.
    buf: Option<AlignedBuf>,
    frame_len: usize,
    mode: ZeroCopyMode,
    tracker: CompletionTracker,
}

impl DeferredSender {
    pub fn new(stream: TcpStream, message: &Message) -> Result<Self> {
        let mode = if sys::probe_zerocopy(&stream)? {
            ZeroCopyMode::Active
        } else {
            info!("zero-copy transmit unsupported on this platform, falling back to plain sendmsg");
            ZeroCopyMode::Fallback
        };
        Self::with_mode(stream, message, mode)
    }

    fn with_mode(stream: TcpStream, message: &Message, mode: ZeroCopyMode) -> Result<Self> {
        let frame_len = frame_size(message.field_size());
        let mut buf = AlignedBuf::new(frame_len)?;
        message.serialize(&mut buf)?;
        Ok(Self {
            stream,
            buf: Some(buf),
            frame_len,
            mode,
            tracker: CompletionTracker::new(),
        })
    }

    pub fn mode(&self) -> ZeroCopyMode {
        self.mode
    }

    pub fn tracker(&self) -> &CompletionTracker {
        &self.tracker
    }

    fn frame(&self) -> Result<&[u8]> {
        match &self.buf {
            Some(buf) => Ok(&buf[..self.frame_len]),
            // Only reachable if a caller keeps sending after a drain timeout
            // already leaked the buffer.
            None => Err(Error::DrainTimeout {
                outstanding: self.tracker.outstanding(),
            }),
        }
    }

    /// Non-blocking read of the error queue. Resolves every notification
    /// found and returns how many sends were confirmed; `Ok(0)` when the
    /// queue is empty, which is the common case.
    pub fn drain_completions(&mut self) -> Result<usize> {
        if self.mode == ZeroCopyMode::Fallback {
            return Ok(0);
        }
        sys::drain_error_queue(&self.stream, &mut self.tracker)
    }

    /// Poll the error queue with backoff until nothing is outstanding or the
    /// budget runs out. On timeout the buffer is leaked: the kernel may still
    /// DMA from those pages, so they must never reach the allocator again.
    fn drain_all(&mut self) -> Result<()> {
        let deadline = Instant::now() + DRAIN_BUDGET;
        while self.tracker.outstanding() > 0 {
            if Instant::now() >= deadline {
                let outstanding = self.tracker.outstanding();
                if let Some(buf) = self.buf.take() {
                    buf.leak();
                }
                return Err(Error::DrainTimeout { outstanding });
            }
            if self.drain_completions()? == 0 {
                thread::sleep(DRAIN_POLL_SLEEP);
            }
        }
        Ok(())
    }
}

impl Transmitter for DeferredSender {
    fn send_frame(&mut self) -> Result<usize> {
        let active = self.mode == ZeroCopyMode::Active;
        loop {
            let attempt = {
                let frame = self.frame()?;
                sys::send_frame(&self.stream, frame, active)
            };
            match attempt {
                Ok(sent) => {
                    // The kernel counts every MSG_ZEROCOPY sendmsg that moved
                    // bytes, even a partial one, so account the id before
                    // judging the write.
                    if active && sent > 0 {
                        self.tracker.issue();
                    }
                    if sent != self.frame_len {
                        return Err(Error::ShortWrite {
                            sent,
                            expected: self.frame_len,
                        });
                    }
                    if active && self.tracker.issued() % DRAIN_INTERVAL == 0 {
                        self.drain_completions()?;
                    }
                    return Ok(sent);
                }
                // Pinned-page backpressure: confirm what we can, then retry
                // the same frame. Never drop it.
                Err(e) if sys::is_backpressure(&e) => {
                    if self.drain_completions()? == 0 {
                        thread::sleep(DRAIN_POLL_SLEEP);
                    }
                }
                Err(e) if is_transient(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn finish(&mut self) -> Result<()> {
        if self.mode == ZeroCopyMode::Fallback {
            return Ok(());
        }
        debug!(
            issued = self.tracker.issued(),
            outstanding = self.tracker.outstanding(),
            "draining zero-copy completions"
        );
        self.drain_all()?;
        debug!(
            resolved = self.tracker.resolved(),
            copied = self.tracker.copied(),
            "all completions resolved"
        );
        Ok(())
    }

    fn frame_len(&self) -> usize {
        self.frame_len
    }
}

impl Drop for DeferredSender {
    fn drop(&mut self) {
        // A connection abandoned with sends still in flight must not hand
        // its pages back to the allocator. Bounded leak, reported once.
        if self.tracker.outstanding() > 0 {
            if let Some(buf) = self.buf.take() {
                warn!(
                    outstanding = self.tracker.outstanding(),
                    "leaking in-flight send buffer at connection close"
                );
                buf.leak();
            }
        }
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use std::io;
    use std::mem;
    use std::net::TcpStream;
    use std::os::unix::io::AsRawFd;

    use super::CompletionTracker;
    use crate::error::Result;

    // Not yet in the libc crate's exported set.
    const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;
    const SO_EE_CODE_ZEROCOPY_COPIED: u8 = 1;

    /// Ask the kernel to enable zero-copy sends on this socket. `Ok(false)`
    /// means the option is unknown (pre-4.14 kernel); any other failure is a
    /// real error.
    pub fn probe_zerocopy(stream: &TcpStream) -> io::Result<bool> {
        let one: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                stream.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ZEROCOPY,
                &one as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOPROTOOPT) {
            return Ok(false);
        }
        Err(err)
    }

    pub fn is_backpressure(err: &io::Error) -> bool {
        err.raw_os_error() == Some(libc::ENOBUFS)
    }

    /// One `sendmsg` of the whole frame, optionally flagged `MSG_ZEROCOPY`.
    pub fn send_frame(stream: &TcpStream, frame: &[u8], zerocopy: bool) -> io::Result<usize> {
        let mut iov = libc::iovec {
            iov_base: frame.as_ptr() as *mut libc::c_void,
            iov_len: frame.len(),
        };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        let flags = if zerocopy { libc::MSG_ZEROCOPY } else { 0 };
        let rc = unsafe { libc::sendmsg(stream.as_raw_fd(), &msg, flags) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    /// Non-blocking `recvmsg(MSG_ERRQUEUE)` pass. Each zerocopy notification
    /// carries an inclusive `[ee_info, ee_data]` sequence range; `ee_code`
    /// reports whether the kernel fell back to copying.
    pub fn drain_error_queue(stream: &TcpStream, tracker: &mut CompletionTracker) -> Result<usize> {
        // u64 backing keeps the control buffer aligned for cmsghdr.
        let mut control = [0u64; 16];
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = mem::size_of_val(&control) as _;

        let rc = unsafe {
            libc::recvmsg(
                stream.as_raw_fd(),
                &mut msg,
                libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(err.into());
        }

        let mut confirmed = 0usize;
        let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        while !cmsg.is_null() {
            let hdr = unsafe { &*cmsg };
            let recv_err = (hdr.cmsg_level == libc::SOL_IP && hdr.cmsg_type == libc::IP_RECVERR)
                || (hdr.cmsg_level == libc::SOL_IPV6 && hdr.cmsg_type == libc::IPV6_RECVERR);
            if recv_err {
                let serr =
                    unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::sock_extended_err) };
                if serr.ee_origin == SO_EE_ORIGIN_ZEROCOPY {
                    let copied = serr.ee_code == SO_EE_CODE_ZEROCOPY_COPIED;
                    confirmed +=
                        tracker.resolve_range(serr.ee_info, serr.ee_data, copied)? as usize;
                }
            }
            cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
        }
        Ok(confirmed)
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
mod sys {
    use std::io;
    use std::mem;
    use std::net::TcpStream;
    use std::os::unix::io::AsRawFd;

    use super::CompletionTracker;
    use crate::error::Result;

    /// No `SO_ZEROCOPY` outside Linux; the strategy runs in Fallback mode.
    pub fn probe_zerocopy(_stream: &TcpStream) -> io::Result<bool> {
        Ok(false)
    }

    pub fn is_backpressure(err: &io::Error) -> bool {
        err.raw_os_error() == Some(libc::ENOBUFS)
    }

    pub fn send_frame(stream: &TcpStream, frame: &[u8], _zerocopy: bool) -> io::Result<usize> {
        let mut iov = libc::iovec {
            iov_base: frame.as_ptr() as *mut libc::c_void,
            iov_len: frame.len(),
        };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        let rc = unsafe { libc::sendmsg(stream.as_raw_fd(), &msg, 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    pub fn drain_error_queue(
        _stream: &TcpStream,
        _tracker: &mut CompletionTracker,
    ) -> Result<usize> {
        Ok(0)
    }
}

#[cfg(not(unix))]
mod sys {
    use std::io::{self, Write};
    use std::net::TcpStream;

    use super::CompletionTracker;
    use crate::error::Result;

    pub fn probe_zerocopy(_stream: &TcpStream) -> io::Result<bool> {
        Ok(false)
    }

    pub fn is_backpressure(_err: &io::Error) -> bool {
        false
    }

    pub fn send_frame(stream: &TcpStream, frame: &[u8], _zerocopy: bool) -> io::Result<usize> {
        (&*stream).write(frame)
    }

    pub fn drain_error_queue(
        _stream: &TcpStream,
        _tracker: &mut CompletionTracker,
    ) -> Result<usize> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn test_tracker_conservation() {
        let mut tracker = CompletionTracker::new();
        for _ in 0..10 {
            tracker.issue();
        }
        assert_eq!(tracker.issued(), 10);
        assert_eq!(tracker.outstanding(), 10);

        assert_eq!(tracker.resolve_range(0, 3, false).unwrap(), 4);
        assert_eq!(tracker.resolve_range(4, 9, true).unwrap(), 6);

        assert_eq!(tracker.outstanding(), 0);
        assert_eq!(tracker.resolved(), 10);
        assert_eq!(tracker.copied(), 6);
    }

    #[test]
    fn test_tracker_rejects_unissued_range() {
        let mut tracker = CompletionTracker::new();
        tracker.issue();
        tracker.issue();

        let err = tracker.resolve_range(1, 5, false).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
        // Rejected range must not touch the outstanding set.
        assert_eq!(tracker.outstanding(), 2);
        assert_eq!(tracker.resolved(), 0);
    }

    #[test]
    fn test_tracker_rejects_double_resolve() {
        let mut tracker = CompletionTracker::new();
        for _ in 0..5 {
            tracker.issue();
        }
        tracker.resolve_range(0, 2, false).unwrap();

        let err = tracker.resolve_range(2, 4, false).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
        // Ids 3 and 4 stay outstanding, untouched by the bad range.
        assert_eq!(tracker.outstanding(), 2);
        assert_eq!(tracker.resolved(), 3);
    }

    #[test]
    fn test_issue_wraps_with_kernel_counter() {
        let mut tracker = CompletionTracker::new();
        tracker.next_seq = u32::MAX;

        assert_eq!(tracker.issue(), u32::MAX);
        assert_eq!(tracker.issue(), 0);
        assert_eq!(tracker.outstanding(), 2);
    }

    #[test]
    fn test_tracker_rejects_inverted_range() {
        let mut tracker = CompletionTracker::new();
        for _ in 0..5 {
            tracker.issue();
        }
        assert!(tracker.resolve_range(3, 1, false).is_err());
        assert_eq!(tracker.outstanding(), 5);
    }

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    // Models a platform without zero-copy support: plain sendmsg, a no-op
    // tracker, and nothing to drain at finish.
    #[test]
    fn test_fallback_mode_sends_and_tracks_nothing() {
        let (client, mut server) = pair();
        let message = Message::new(32);
        let mut sender =
            DeferredSender::with_mode(client, &message, ZeroCopyMode::Fallback).unwrap();

        for _ in 0..10 {
            let sent = sender.send_frame().unwrap();
            assert_eq!(sent, frame_size(32));
        }
        assert_eq!(sender.tracker().issued(), 0);
        assert_eq!(sender.drain_completions().unwrap(), 0);
        sender.finish().unwrap();

        let mut buf = vec![0u8; 10 * frame_size(32)];
        server.read_exact(&mut buf).unwrap();
        let received = Message::deserialize(&buf).unwrap();
        assert_eq!(received.fields(), message.fields());
    }

    // A connection dropped with unresolved sends must leak its buffer via
    // `AlignedBuf::leak` rather than free pages the kernel may still read.
    #[test]
    fn test_drop_with_outstanding_sends_leaks_buffer() {
        let (client, _server) = pair();
        let message = Message::new(32);
        let mut sender =
            DeferredSender::with_mode(client, &message, ZeroCopyMode::Fallback).unwrap();

        sender.tracker.issue();
        assert!(sender.buf.is_some());
        assert_eq!(sender.tracker.outstanding(), 1);
        // Drop must take the leak path, not the allocator path.
        drop(sender);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_active_mode_resolves_every_send_on_loopback() {
        let (client, mut server) = pair();
        let message = Message::new(128);
        let mut sender = DeferredSender::new(client, &message).unwrap();
        if sender.mode() != ZeroCopyMode::Active {
            // Pre-4.14 kernel; nothing to verify here.
            return;
        }

        let frame_len = frame_size(128);
        let reader = std::thread::spawn(move || {
            let mut sink = vec![0u8; frame_len];
            for _ in 0..50 {
                server.read_exact(&mut sink).unwrap();
            }
        });

        for _ in 0..50 {
            sender.send_frame().unwrap();
        }
        assert_eq!(sender.tracker().issued(), 50);

        sender.finish().unwrap();
        assert_eq!(sender.tracker().outstanding(), 0);
        assert_eq!(sender.tracker().resolved(), 50);
        reader.join().unwrap();
    }
}
