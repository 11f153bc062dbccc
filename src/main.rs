use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sendbench::config::{Config, Strategy};
use sendbench::worker::ShutdownToken;
use sendbench::{client, server};

#[derive(Parser, Debug)]
#[command(name = "sendbench")]
#[command(about = "TCP send-path benchmark: copying vs vectored vs zero-copy transmission")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept connections and sink frames
    Server {
        /// Address to bind
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,

        /// Total message payload size in bytes (split over 8 fields)
        #[arg(short, long, default_value = "1024")]
        msgsize: usize,

        /// How long to accept new connections, in seconds
        #[arg(short, long, default_value = "10")]
        duration: u64,
    },
    /// Connect and send frames with the chosen strategy
    Client {
        /// Target server address
        #[arg(short, long, default_value = "127.0.0.1:9000")]
        target: SocketAddr,

        /// Total message payload size in bytes (split over 8 fields)
        #[arg(short, long, default_value = "1024")]
        msgsize: usize,

        /// Run duration in seconds
        #[arg(short, long, default_value = "10")]
        duration: u64,

        /// Number of sender threads
        #[arg(long, default_value = "1")]
        threads: usize,

        /// Send path to exercise
        #[arg(short, long, value_enum, default_value = "copying")]
        strategy: Strategy,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let token = ShutdownToken::new();
    let ctrlc_token = token.clone();
    ctrlc::set_handler(move || {
        info!("shutdown requested");
        ctrlc_token.request();
    })
    .context("installing signal handler")?;

    let report = match args.command {
        Commands::Server {
            bind,
            msgsize,
            duration,
        } => {
            let config = Config {
                endpoint: bind,
                field_size: Config::field_size_from_msgsize(msgsize),
                duration: Duration::from_secs(duration),
                threads: 1,
                strategy: Strategy::Copying,
            };
            server::run(&config, &token)?
        }
        Commands::Client {
            target,
            msgsize,
            duration,
            threads,
            strategy,
        } => {
            let config = Config {
                endpoint: target,
                field_size: Config::field_size_from_msgsize(msgsize),
                duration: Duration::from_secs(duration),
                threads,
                strategy,
            };
            client::run(&config, &token)?
        }
    };

    println!("\n{report}");
    Ok(())
}
