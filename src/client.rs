use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::config::Config;
use crate::message::Message;
use crate::net;
use crate::stats::{Report, StatsAggregator};
use crate::strategy;
use crate::worker::{self, ShutdownToken};

/// Run the sending side: N independent sender threads against one target,
/// each with its own connection, buffer, and strategy instance, all folding
/// into one aggregator. A worker's fatal error is logged and terminates only
/// that worker.
pub fn run(config: &Config, token: &ShutdownToken) -> Result<Report> {
    info!(
        endpoint = %config.endpoint,
        strategy = config.strategy.label(),
        threads = config.threads,
        field_size = config.field_size,
        "client starting"
    );

    let aggregator = Arc::new(StatsAggregator::new());
    let deadline = Instant::now() + config.duration;

    let mut handles = Vec::with_capacity(config.threads);
    for worker_id in 0..config.threads {
        let config = config.clone();
        let token = token.clone();
        let aggregator = Arc::clone(&aggregator);

        let handle = thread::Builder::new()
            .name(format!("send-{worker_id}"))
            .spawn(move || {
                if let Err(e) = sender_worker(worker_id, &config, deadline, &token, &aggregator) {
                    error!(worker_id, "sender failed: {e:#}");
                }
            })
            .context("spawning sender thread")?;
        handles.push(handle);
    }

    for handle in handles {
        if handle.join().is_err() {
            error!("sender thread panicked");
        }
    }

    Ok(aggregator.report(&format!(
        "Client ({})",
        config.strategy.label()
    )))
}

fn sender_worker(
    worker_id: usize,
    config: &Config,
    deadline: Instant,
    token: &ShutdownToken,
    aggregator: &StatsAggregator,
) -> Result<()> {
    let stream = net::connect(config.endpoint)?;
    let message = Message::new(config.field_size);
    let tx = strategy::build(config.strategy, stream, &message)?;
    worker::run_sender(worker_id, tx, deadline, token, aggregator)?;
    Ok(())
}
