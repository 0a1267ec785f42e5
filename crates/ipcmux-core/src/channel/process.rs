//! Channel to a spawned worker process.

use std::io::{BufReader, BufWriter};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{CHANNEL_ENV, SpawnConfig};
use crate::error::{Error, Result};
use crate::framing::{read_frame, write_frame};

use super::{Channel, ChannelHooks, ChannelId, CloseHandler, HandlerToken, MessageHandler, lock};

/// Channel to a child process over its stdin/stdout.
///
/// Frames go to the child's stdin. A reader thread reads frames from the
/// child's stdout and runs the message handlers inline; frames arriving
/// before a handler is attached are dropped. The channel closes when the
/// child's stdout reaches EOF. Dropping the channel kills the child.
///
/// Handlers block the reader. See [`Channel`] for the resulting deadlock
/// hazard when a handler writes back to a child that is itself blocked.
pub struct ProcessChannel {
    id: ChannelId,
    pid: u32,
    child: Mutex<Child>,
    stdin: Mutex<Option<BufWriter<ChildStdin>>>,
    hooks: Arc<ChannelHooks>,
    killed: AtomicBool,
}

impl ProcessChannel {
    /// Spawn a worker process and connect to it.
    pub fn spawn(config: &SpawnConfig) -> Result<Arc<Self>> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .envs(config.envs.iter().map(|(k, v)| (k, v)))
            .env(CHANNEL_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Let worker stderr pass through for debugging
            .spawn()
            .map_err(|source| Error::Spawn {
                program: config.program.display().to_string(),
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdout".to_string()))?;

        let id = ChannelId::next();
        let pid = child.id();
        let hooks = ChannelHooks::new();

        let channel = Arc::new(Self {
            id,
            pid,
            child: Mutex::new(child),
            stdin: Mutex::new(Some(BufWriter::new(stdin))),
            hooks: Arc::clone(&hooks),
            killed: AtomicBool::new(false),
        });

        std::thread::Builder::new()
            .name(format!("ipcmux-reader-{}", pid))
            .spawn(move || read_loop(id, stdout, hooks))?;

        tracing::debug!("Spawned worker pid {} as channel {}", pid, id);
        Ok(channel)
    }

    /// Process ID of the worker.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Kill the worker process immediately. Idempotent.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }

        lock(&self.stdin).take();
        if let Err(e) = lock(&self.child).kill() {
            // InvalidInput means the process already exited, which is fine
            if e.kind() != std::io::ErrorKind::InvalidInput {
                tracing::warn!("Failed to kill worker {}: {}", self.pid, e);
            }
        }
        self.hooks.mark_closed(self.id);
    }

    /// Wait for the worker to exit.
    ///
    /// Call [`Channel::close`] first so the worker sees EOF on stdin.
    pub fn wait(&self) -> Result<ExitStatus> {
        Ok(lock(&self.child).wait()?)
    }

    /// Check if the worker process is still running.
    pub fn is_alive(&self) -> bool {
        if self.killed.load(Ordering::SeqCst) {
            return false;
        }
        matches!(lock(&self.child).try_wait(), Ok(None))
    }
}

fn read_loop(id: ChannelId, stdout: ChildStdout, hooks: Arc<ChannelHooks>) {
    let mut reader = BufReader::new(stdout);
    loop {
        match read_frame(&mut reader) {
            Ok(Some(frame)) => {
                if !hooks.deliver(&frame) {
                    tracing::trace!("Dropping frame on channel {} with no handler", id);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Channel {} read failed: {}", id, e);
                break;
            }
        }
    }
    hooks.mark_closed(id);
}

impl Channel for ProcessChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send(&self, frame: &[u8]) -> bool {
        if self.hooks.is_closed() {
            return false;
        }
        let mut stdin = lock(&self.stdin);
        let Some(writer) = stdin.as_mut() else {
            return false;
        };
        match write_frame(writer, frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Write to worker {} failed: {}", self.pid, e);
                false
            }
        }
    }

    fn add_message_handler(&self, handler: MessageHandler) -> HandlerToken {
        self.hooks.add_message_handler(handler)
    }

    fn remove_message_handler(&self, token: HandlerToken) {
        self.hooks.remove_message_handler(token);
    }

    fn on_close(&self, handler: CloseHandler) -> HandlerToken {
        self.hooks.on_close(self.id, handler)
    }

    fn remove_close_handler(&self, token: HandlerToken) {
        self.hooks.remove_close_handler(token);
    }

    fn is_closed(&self) -> bool {
        self.hooks.is_closed()
    }

    /// Close the worker's stdin. The channel is closed from this side at once.
    fn close(&self) {
        lock(&self.stdin).take();
        self.hooks.mark_closed(self.id);
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        self.kill();
        let _ = lock(&self.child).wait();
    }
}
