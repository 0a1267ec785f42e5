//! In-process channel pair.

use std::sync::Arc;

use super::{Channel, ChannelHooks, ChannelId, CloseHandler, HandlerToken, MessageHandler};

/// One end of an in-process channel pair.
///
/// A frame sent on one end is delivered synchronously, on the sender's
/// thread, to the other end's message handlers. Frames sent while the peer
/// has no handler are accepted and dropped, like bytes written to a pipe
/// nobody reads. Closing either end closes both.
pub struct MemoryChannel {
    id: ChannelId,
    hooks: Arc<ChannelHooks>,
    peer_id: ChannelId,
    peer: Arc<ChannelHooks>,
}

impl MemoryChannel {
    /// Create two connected ends.
    pub fn pair() -> (Arc<dyn Channel>, Arc<dyn Channel>) {
        let (a_id, b_id) = (ChannelId::next(), ChannelId::next());
        let (a_hooks, b_hooks) = (ChannelHooks::new(), ChannelHooks::new());

        let a = Self {
            id: a_id,
            hooks: Arc::clone(&a_hooks),
            peer_id: b_id,
            peer: Arc::clone(&b_hooks),
        };
        let b = Self {
            id: b_id,
            hooks: b_hooks,
            peer_id: a_id,
            peer: a_hooks,
        };

        (Arc::new(a), Arc::new(b))
    }
}

impl Channel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send(&self, frame: &[u8]) -> bool {
        if self.hooks.is_closed() {
            return false;
        }
        self.peer.deliver(frame);
        true
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

    fn close(&self) {
        self.hooks.mark_closed(self.id);
        self.peer.mark_closed(self.peer_id);
    }
}
