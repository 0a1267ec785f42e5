//! ipcmux CLI - spawn a worker pool and talk to it through the multiplexer.

mod broadcast;
mod ping;
mod pool;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ipcmux")]
#[command(about = "Publish/subscribe messaging across a pool of worker processes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (also forwarded to workers)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the ipcmux-worker binary
    #[arg(long, global = true)]
    worker_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ping every worker and wait for the replies
    Ping {
        /// Number of workers to spawn
        #[arg(short, long, default_value = "2")]
        workers: usize,

        /// How long to wait for replies, in milliseconds
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,

        /// Deregister workers whose channel closes
        #[arg(long)]
        auto_remove: bool,
    },

    /// Broadcast one message and report per-worker send results
    Broadcast {
        /// Number of workers to spawn
        #[arg(short, long, default_value = "2")]
        workers: usize,

        /// Operation code
        #[arg(long)]
        op: i64,

        /// JSON payload
        #[arg(long, default_value = "null")]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let spawn = pool::spawn_config(cli.worker_path, cli.verbose)?;

    match cli.command {
        Commands::Ping {
            workers,
            timeout_ms,
            auto_remove,
        } => ping::execute(&spawn, workers, timeout_ms, auto_remove).await?,

        Commands::Broadcast {
            workers,
            op,
            payload,
        } => broadcast::execute(&spawn, workers, op, &payload).await?,
    }

    Ok(())
}
