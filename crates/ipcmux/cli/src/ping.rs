//! Ping command implementation.

use std::time::{Duration, Instant};

use ipcmux::{Ping, Pong, ops};
use ipcmux_core::{Multiplexer, MultiplexerConfig, SpawnConfig};
use serde_json::json;
use tokio::sync::mpsc;

use crate::pool::WorkerPool;

/// Spawn workers, ping them all, and print each reply.
pub async fn execute(
    spawn: &SpawnConfig,
    workers: usize,
    timeout_ms: u64,
    auto_remove: bool,
) -> anyhow::Result<()> {
    let mux = Multiplexer::root(MultiplexerConfig::default().with_auto_remove(auto_remove));

    let (tx, mut rx) = mpsc::unbounded_channel::<Pong>();
    mux.subscribe(ops::PONG, move |pong: Pong| {
        let _ = tx.send(pong);
    });

    let pool = WorkerPool::spawn(spawn, workers, &mux)?;

    let started = Instant::now();
    let ping = Ping {
        seq: 1,
        echo: json!({ "from": std::process::id() }),
    };
    let sent = mux.broadcast(ops::PING, &ping);
    let expected = sent.iter().filter(|(_, ok)| *ok).count();
    for (id, ok) in &sent {
        if !ok {
            eprintln!("failed to ping worker {}", id);
        }
    }

    let mut replies = 0;
    let deadline = tokio::time::sleep(Duration::from_millis(timeout_ms));
    tokio::pin!(deadline);
    while replies < expected {
        tokio::select! {
            pong = rx.recv() => match pong {
                Some(pong) => {
                    replies += 1;
                    println!(
                        "pong from pid {} (seq {}) in {:?}",
                        pong.pid,
                        pong.seq,
                        started.elapsed()
                    );
                }
                None => break,
            },
            _ = &mut deadline => {
                tracing::warn!("Timed out waiting for replies");
                break;
            }
        }
    }

    println!("{}/{} workers replied", replies, workers);

    let clean = pool.shutdown(&mux).await?;
    tracing::debug!("{} worker(s) exited cleanly", clean);

    if replies < workers {
        anyhow::bail!("{} worker(s) did not reply", workers - replies);
    }
    Ok(())
}
