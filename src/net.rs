use std::net::{SocketAddr, TcpListener, TcpStream};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

/// Accept backlog for the benchmark listener.
const BACKLOG: i32 = 100;

/// Socket buffer size requested on both ends (the kernel doubles it).
const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Build the benchmark listener: address reuse on, large buffers, and
/// non-blocking accept so the accept loop can poll the shutdown token.
pub fn listener(bind: SocketAddr) -> Result<TcpListener> {
    let domain = Domain::for_address(bind);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .context("creating listener socket")?;

    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    socket.set_reuse_port(true)?;
    socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;

    socket
        .bind(&bind.into())
        .with_context(|| format!("binding to {}", bind))?;
    socket.listen(BACKLOG)?;

    let listener: TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    debug!("listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Connect to the target and tune the stream for the send loop: Nagle off so
/// per-message latency reflects the syscall, large send buffer so the copying
/// path is not artificially throttled.
pub fn connect(target: SocketAddr) -> Result<TcpStream> {
    let domain = Domain::for_address(target);
    let socket =
        Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).context("creating socket")?;
    socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;

    socket
        .connect(&target.into())
        .with_context(|| format!("connecting to {}", target))?;

    let stream: TcpStream = socket.into();
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Tune an accepted stream: disable delay coalescing, match buffer sizing.
pub fn tune_accepted(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    stream.set_nonblocking(false)?;
    Ok(())
}
