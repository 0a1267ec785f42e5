//! Worker set: the channels currently registered as workers.

use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::channel::{Channel, ChannelId, HandlerToken};

/// A registered worker and the handlers its multiplexer attached to it.
pub struct WorkerEntry {
    /// The worker's channel.
    pub channel: Arc<dyn Channel>,
    /// The multiplexer's message handler on the channel.
    pub message_token: HandlerToken,
    /// The auto-remove close handler, if one is attached.
    pub close_token: Option<HandlerToken>,
}

impl WorkerEntry {
    /// Detach every handler this entry tracks from its channel.
    pub fn detach(&self) {
        self.channel.remove_message_handler(self.message_token);
        if let Some(token) = self.close_token {
            self.channel.remove_close_handler(token);
        }
    }
}

/// Registered worker channels, unique by identity, in registration order.
#[derive(Default)]
pub struct WorkerSet {
    order: Vec<WorkerEntry>,
    ids: FxHashSet<ChannelId>,
}

impl WorkerSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a channel. Returns `false` if it was already present.
    pub fn insert(&mut self, channel: Arc<dyn Channel>, message_token: HandlerToken) -> bool {
        if !self.ids.insert(channel.id()) {
            return false;
        }
        self.order.push(WorkerEntry {
            channel,
            message_token,
            close_token: None,
        });
        true
    }

    /// Record the close handler attached to a registered channel.
    ///
    /// Returns `false` if the channel is no longer registered.
    pub fn set_close_token(&mut self, id: ChannelId, token: HandlerToken) -> bool {
        match self.order.iter_mut().find(|entry| entry.channel.id() == id) {
            Some(entry) => {
                entry.close_token = Some(token);
                true
            }
            None => false,
        }
    }

    /// Remove a channel by identity, returning its entry if it was present.
    pub fn remove(&mut self, id: ChannelId) -> Option<WorkerEntry> {
        if !self.ids.remove(&id) {
            return None;
        }
        let index = self.order.iter().position(|entry| entry.channel.id() == id)?;
        Some(self.order.remove(index))
    }

    /// Whether a channel is registered.
    pub fn contains(&self, id: ChannelId) -> bool {
        self.ids.contains(&id)
    }

    /// Snapshot of the registered channels in registration order.
    pub fn snapshot(&self) -> Vec<Arc<dyn Channel>> {
        self.order
            .iter()
            .map(|entry| Arc::clone(&entry.channel))
            .collect()
    }

    /// Identities in registration order.
    pub fn ids(&self) -> Vec<ChannelId> {
        self.order.iter().map(|entry| entry.channel.id()).collect()
    }

    /// Remove and return every entry.
    pub fn drain(&mut self) -> Vec<WorkerEntry> {
        self.ids.clear();
        std::mem::take(&mut self.order)
    }

    /// Number of registered channels.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no channels are registered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
