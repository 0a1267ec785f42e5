//! Worker pool management for the CLI.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use ipcmux::ops;
use ipcmux_core::{Channel, ChannelId, Multiplexer, ProcessChannel, SpawnConfig};

/// Build the spawn configuration for `ipcmux-worker`.
pub fn spawn_config(worker_path: Option<PathBuf>, verbose: bool) -> anyhow::Result<SpawnConfig> {
    let config = match worker_path {
        Some(path) => SpawnConfig::new(path),
        None => SpawnConfig::worker().context("Could not locate ipcmux-worker")?,
    };

    Ok(if verbose {
        config.env("RUST_LOG", "debug")
    } else {
        config
    })
}

/// A set of spawned workers registered with one multiplexer.
pub struct WorkerPool {
    workers: Vec<Arc<ProcessChannel>>,
}

impl WorkerPool {
    /// Spawn `count` workers and register them with `mux`.
    pub fn spawn(config: &SpawnConfig, count: usize, mux: &Multiplexer) -> anyhow::Result<Self> {
        let mut workers = Vec::with_capacity(count);
        for _ in 0..count {
            let worker = ProcessChannel::spawn(config)
                .with_context(|| format!("Failed to spawn {}", config.program.display()))?;
            let channel: Arc<dyn Channel> = worker.clone();
            mux.add_worker(&channel);
            workers.push(worker);
        }
        Ok(Self { workers })
    }

    /// Process ID of the worker behind a channel.
    pub fn pid_of(&self, id: ChannelId) -> Option<u32> {
        self.workers
            .iter()
            .find(|worker| worker.id() == id)
            .map(|worker| worker.pid())
    }

    /// Ask every worker to exit, then close and reap them.
    ///
    /// Returns the number of workers that exited cleanly.
    pub async fn shutdown(self, mux: &Multiplexer) -> anyhow::Result<usize> {
        mux.broadcast(ops::SHUTDOWN, &());

        tokio::task::spawn_blocking(move || {
            let mut clean = 0;
            for worker in &self.workers {
                worker.close();
                match worker.wait() {
                    Ok(status) if status.success() => clean += 1,
                    Ok(status) => {
                        tracing::warn!("Worker {} exited with status: {}", worker.pid(), status)
                    }
                    Err(e) => tracing::warn!("Failed to wait for worker {}: {}", worker.pid(), e),
                }
            }
            clean
        })
        .await
        .context("Worker shutdown task failed")
    }
}
