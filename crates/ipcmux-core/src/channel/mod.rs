//! Channel handles: bidirectional byte-message conduits.
//!
//! A [`Channel`] connects this process to one worker, or to its own parent.
//! It moves whole frames, reports incoming frames to every attached message
//! handler, and signals closure once.
//!
//! Implementations:
//! - [`MemoryChannel`]: in-process pair, for embedding and tests
//! - [`ProcessChannel`]: a spawned child process over piped stdio
//! - [`StdioChannel`]: the worker side of a `ProcessChannel`

mod memory;
mod process;
mod stdio;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use memory::MemoryChannel;
pub use process::ProcessChannel;
pub use stdio::{ParentLink, StdioChannel};

/// Callback invoked with each frame received on a channel.
pub type MessageHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// One-shot callback invoked when a channel closes.
pub type CloseHandler = Box<dyn FnOnce(ChannelId) + Send>;

/// Process-unique identity of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocate a fresh identity.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies one attached handler so its owner can detach exactly that one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken(u64);

impl HandlerToken {
    /// Allocate a fresh token.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A bidirectional byte-message conduit.
///
/// Any number of message and close handlers may be attached; each attach
/// returns a token that detaches only that handler. The multiplexer borrows
/// channels while they are registered; it never closes them.
///
/// Message handlers run on the thread that received the frame (for process
/// and stdio channels, a dedicated reader thread). While a handler runs, no
/// further frames are read from that channel, so a handler that blocks on a
/// `send` to the same peer while the peer is itself blocked writing to us
/// deadlocks both sides. Hand long or blocking work off to another thread.
pub trait Channel: Send + Sync + 'static {
    /// Identity of this channel.
    fn id(&self) -> ChannelId;

    /// Send one frame. Returns `false` if the channel is closed or the
    /// transport rejected the write.
    fn send(&self, frame: &[u8]) -> bool;

    /// Attach a message handler. Every attached handler sees every frame.
    fn add_message_handler(&self, handler: MessageHandler) -> HandlerToken;

    /// Detach a message handler. Unknown tokens are ignored.
    fn remove_message_handler(&self, token: HandlerToken);

    /// Register a one-shot close handler. Fires immediately if the channel
    /// is already closed.
    fn on_close(&self, handler: CloseHandler) -> HandlerToken;

    /// Unregister a close handler that has not fired yet. Unknown or
    /// already-fired tokens are ignored.
    fn remove_close_handler(&self, token: HandlerToken);

    /// Whether the channel has closed.
    fn is_closed(&self) -> bool;

    /// Close the channel, firing close handlers.
    fn close(&self);
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handler lists shared between a channel and its reader thread.
#[derive(Default)]
pub(crate) struct ChannelHooks {
    message: Mutex<Vec<(HandlerToken, MessageHandler)>>,
    close: Mutex<Vec<(HandlerToken, CloseHandler)>>,
    closed: AtomicBool,
}

impl ChannelHooks {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn add_message_handler(&self, handler: MessageHandler) -> HandlerToken {
        let token = HandlerToken::next();
        lock(&self.message).push((token, handler));
        token
    }

    pub(crate) fn remove_message_handler(&self, token: HandlerToken) {
        lock(&self.message).retain(|(other, _)| *other != token);
    }

    /// Hand a frame to every attached message handler. Returns `false` if
    /// none was attached.
    ///
    /// Handlers run without the list locked so they may attach or detach.
    pub(crate) fn deliver(&self, frame: &[u8]) -> bool {
        let handlers: Vec<MessageHandler> = lock(&self.message)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in &handlers {
            handler(frame);
        }
        !handlers.is_empty()
    }

    pub(crate) fn on_close(&self, id: ChannelId, handler: CloseHandler) -> HandlerToken {
        let token = HandlerToken::next();
        let mut handlers = lock(&self.close);
        if self.closed.load(Ordering::SeqCst) {
            drop(handlers);
            handler(id);
        } else {
            handlers.push((token, handler));
        }
        token
    }

    pub(crate) fn remove_close_handler(&self, token: HandlerToken) {
        lock(&self.close).retain(|(other, _)| *other != token);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark closed and fire close handlers. Returns `false` if already closed.
    pub(crate) fn mark_closed(&self, id: ChannelId) -> bool {
        let handlers = {
            let mut handlers = lock(&self.close);
            if self.closed.swap(true, Ordering::SeqCst) {
                return false;
            }
            std::mem::take(&mut *handlers)
        };

        tracing::debug!("Channel {} closed", id);
        for (_, handler) in handlers {
            handler(id);
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn close_handler_count(&self) -> usize {
        lock(&self.close).len()
    }
}
