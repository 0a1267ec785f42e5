//! Broadcast command implementation.

use anyhow::Context;
use ipcmux_core::{Multiplexer, MultiplexerConfig, SpawnConfig};
use serde_json::Value;

use crate::pool::WorkerPool;

/// Spawn workers, broadcast one message, and print per-worker results.
pub async fn execute(
    spawn: &SpawnConfig,
    workers: usize,
    op: i64,
    payload: &str,
) -> anyhow::Result<()> {
    let payload: Value = serde_json::from_str(payload).context("invalid JSON payload")?;

    let mux = Multiplexer::root(MultiplexerConfig::default());
    let pool = WorkerPool::spawn(spawn, workers, &mux)?;

    let results = mux.broadcast(op, &payload);
    for (id, ok) in &results {
        let pid = pool
            .pid_of(*id)
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "?".to_string());
        println!(
            "worker {} (pid {}): {}",
            id,
            pid,
            if *ok { "ok" } else { "failed" }
        );
    }

    pool.shutdown(&mux).await?;

    let failed = results.iter().filter(|(_, ok)| !ok).count();
    if failed > 0 {
        anyhow::bail!("{} of {} sends failed", failed, results.len());
    }
    Ok(())
}
