use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::net;
use crate::stats::{Report, StatsAggregator};
use crate::worker::{self, ShutdownToken};

/// How long the accept loop sleeps between empty polls.
const ACCEPT_POLL_SLEEP: Duration = Duration::from_millis(50);

/// Receivers get a little slack past the nominal run so in-flight frames from
/// senders that started late still land.
const RECEIVE_GRACE: Duration = Duration::from_secs(5);

/// The sink side: accepts connections until the deadline or shutdown, one
/// receiver thread per connection, joins everything, reports once.
pub struct Server {
    listener: TcpListener,
    field_size: usize,
    duration: Duration,
}

impl Server {
    /// Bind the listener up front so callers can learn the actual port
    /// before starting the run (the benchmark harness binds port 0).
    pub fn bind(config: &Config) -> Result<Self> {
        let listener = net::listener(config.endpoint)?;
        Ok(Self {
            listener,
            field_size: config.field_size,
            duration: config.duration,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn run(self, token: &ShutdownToken) -> Result<Report> {
        let local_addr = self.listener.local_addr()?;
        info!(
            %local_addr,
            field_size = self.field_size,
            "server accepting connections"
        );

        let aggregator = Arc::new(StatsAggregator::new());
        let accept_deadline = Instant::now() + self.duration;
        let receive_deadline = accept_deadline + RECEIVE_GRACE;

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let mut next_worker = 0usize;

        while Instant::now() < accept_deadline && !token.is_set() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let worker_id = next_worker;
                    next_worker += 1;
                    debug!(worker_id, %peer, "accepted connection");

                    if let Err(e) = net::tune_accepted(&stream) {
                        error!(worker_id, %peer, "failed to tune accepted stream: {e:#}");
                        continue;
                    }

                    let field_size = self.field_size;
                    let token = token.clone();
                    let aggregator = Arc::clone(&aggregator);
                    // Handles are joined below so every worker's stats are
                    // folded before the report; a failed worker never takes
                    // down its siblings.
                    let handle = thread::Builder::new()
                        .name(format!("recv-{worker_id}"))
                        .spawn(move || {
                            if let Err(e) = worker::run_receiver(
                                worker_id,
                                stream,
                                field_size,
                                receive_deadline,
                                &token,
                                &aggregator,
                            ) {
                                error!(worker_id, "receiver failed: {e}");
                            }
                        })
                        .context("spawning receiver thread")?;
                    handles.push(handle);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_SLEEP);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("accept failed"),
            }
        }

        info!(
            connections = next_worker,
            "accept loop finished, joining receivers"
        );
        for handle in handles {
            if handle.join().is_err() {
                error!("receiver thread panicked");
            }
        }

        Ok(aggregator.report("Server"))
    }
}

/// Bind and run in one step.
pub fn run(config: &Config, token: &ShutdownToken) -> Result<Report> {
    Server::bind(config)?.run(token)
}
