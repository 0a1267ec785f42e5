//! The worker side of a process channel: this process's own stdin/stdout.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::config::CHANNEL_ENV;
use crate::framing::{read_frame, write_frame};

use super::{Channel, ChannelHooks, ChannelId, CloseHandler, HandlerToken, MessageHandler};

/// Upward channel to the parent over stdin/stdout.
///
/// There is one per process: stdin has a single reader. The reader thread
/// starts when the first message handler is attached and closes the channel
/// on EOF. Frames read while no handler is attached are dropped. Nothing
/// else may write to stdout while this channel is in use; log to stderr
/// instead.
///
/// Handlers run on the reader thread; see [`Channel`] before blocking in one.
pub struct StdioChannel {
    id: ChannelId,
    hooks: Arc<ChannelHooks>,
    reader_started: AtomicBool,
}

impl StdioChannel {
    /// The process-wide stdio channel.
    pub fn from_stdio() -> Arc<Self> {
        static CHANNEL: OnceLock<Arc<StdioChannel>> = OnceLock::new();
        Arc::clone(CHANNEL.get_or_init(|| {
            Arc::new(Self {
                id: ChannelId::next(),
                hooks: ChannelHooks::new(),
                reader_started: AtomicBool::new(false),
            })
        }))
    }

    fn start_reader(&self) {
        if self.reader_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let id = self.id;
        let hooks = Arc::clone(&self.hooks);
        let spawned = std::thread::Builder::new()
            .name("ipcmux-parent-reader".to_string())
            .spawn(move || {
                let mut stdin = std::io::stdin().lock();
                loop {
                    match read_frame(&mut stdin) {
                        Ok(Some(frame)) => {
                            hooks.deliver(&frame);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!("Parent channel read failed: {}", e);
                            break;
                        }
                    }
                }
                hooks.mark_closed(id);
            });

        if let Err(e) = spawned {
            tracing::error!("Failed to start parent channel reader: {}", e);
            self.hooks.mark_closed(id);
        }
    }
}

impl Channel for StdioChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send(&self, frame: &[u8]) -> bool {
        if self.hooks.is_closed() {
            return false;
        }
        let mut stdout = std::io::stdout().lock();
        match write_frame(&mut stdout, frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Write to parent failed: {}", e);
                false
            }
        }
    }

    fn add_message_handler(&self, handler: MessageHandler) -> HandlerToken {
        let token = self.hooks.add_message_handler(handler);
        self.start_reader();
        token
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

    /// Stop using stdio. The process's stdout is flushed but stays open.
    fn close(&self) {
        let _ = std::io::stdout().lock().flush();
        self.hooks.mark_closed(self.id);
    }
}

/// Process-identity capability: whether this process has a parent channel.
pub struct ParentLink;

impl ParentLink {
    /// Whether this process was spawned as an ipcmux worker.
    pub fn is_worker() -> bool {
        std::env::var_os(CHANNEL_ENV).is_some_and(|v| v == "1")
    }

    /// The channel to the parent, if this process was spawned as a worker.
    pub fn detect() -> Option<Arc<dyn Channel>> {
        if Self::is_worker() {
            let channel: Arc<dyn Channel> = StdioChannel::from_stdio();
            Some(channel)
        } else {
            None
        }
    }
}
