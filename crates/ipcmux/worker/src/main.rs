//! Echo worker for ipcmux.
//!
//! Spawned by a parent with frames on stdin/stdout. Answers PING with PONG
//! and exits on SHUTDOWN or when the parent goes away.

use std::sync::mpsc;

use anyhow::Context;
use ipcmux::ops;
use ipcmux::{Ping, Pong};
use ipcmux_core::{Multiplexer, MultiplexerConfig, ParentLink};
use serde_json::Value;

fn main() -> anyhow::Result<()> {
    // stdout carries frames, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let parent = ParentLink::detect()
        .context("ipcmux-worker must be spawned by an ipcmux parent process")?;

    let (done_tx, done_rx) = mpsc::channel::<&'static str>();

    let on_close = done_tx.clone();
    parent.on_close(Box::new(move |_| {
        let _ = on_close.send("parent channel closed");
    }));

    // Hold frames until the listeners below exist; the parent may ping as
    // soon as it has spawned us.
    let mux = Multiplexer::paused(MultiplexerConfig::default(), Some(parent));
    let pid = std::process::id();

    let reply = mux.clone();
    mux.subscribe(ops::PING, move |ping: Ping| {
        tracing::debug!("Worker {} got ping {}", pid, ping.seq);
        let pong = Pong {
            pid,
            seq: ping.seq,
            echo: ping.echo,
        };
        if !reply.send_to_parent(ops::PONG, &pong) {
            tracing::warn!("Worker {} could not reply to ping {}", pid, ping.seq);
        }
    });

    mux.subscribe(ops::SHUTDOWN, move |_: Value| {
        let _ = done_tx.send("shutdown requested");
    });

    let queued = mux.resume();
    if queued > 0 {
        tracing::debug!("Worker {} replayed {} early frame(s)", pid, queued);
    }

    let reason = done_rx
        .recv()
        .context("worker lost every shutdown signal")?;
    tracing::debug!("Worker {} exiting: {}", pid, reason);

    Ok(())
}
