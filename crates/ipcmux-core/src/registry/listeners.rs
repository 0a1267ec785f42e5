//! Listener registry: subscriptions keyed by id and indexed by op code.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::message::{Message, OpCode};

/// A listener callback. Receives the full envelope.
pub type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Stable identifier of a subscription, used to remove it later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct Entry {
    op: OpCode,
    callback: Callback,
}

/// Subscriptions by id, with an op index so dispatch only touches matches.
///
/// Several subscriptions may share an op; they are returned in the order
/// they were registered.
#[derive(Default)]
pub struct ListenerRegistry {
    entries: FxHashMap<SubscriptionId, Entry>,
    by_op: FxHashMap<OpCode, Vec<SubscriptionId>>,
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback under a fresh id.
    pub fn insert(&mut self, op: OpCode, callback: Callback) -> SubscriptionId {
        let id = SubscriptionId::generate();
        self.by_op.entry(op).or_default().push(id.clone());
        self.entries.insert(id.clone(), Entry { op, callback });
        id
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn remove(&mut self, id: &SubscriptionId) -> bool {
        let Some(entry) = self.entries.remove(id) else {
            return false;
        };

        if let Some(ids) = self.by_op.get_mut(&entry.op) {
            ids.retain(|other| other != id);
            if ids.is_empty() {
                self.by_op.remove(&entry.op);
            }
        }
        true
    }

    /// Remove every subscription on `op`. Returns how many were removed.
    pub fn remove_op(&mut self, op: OpCode) -> usize {
        let Some(ids) = self.by_op.remove(&op) else {
            return 0;
        };
        for id in &ids {
            self.entries.remove(id);
        }
        ids.len()
    }

    /// Snapshot of the callbacks registered on `op`.
    pub fn matching(&self, op: OpCode) -> Vec<Callback> {
        self.by_op
            .get(&op)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.entries.get(id))
                    .map(|entry| Arc::clone(&entry.callback))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn contains(&self, id: &SubscriptionId) -> bool {
        self.entries.contains_key(id)
    }

    #[cfg(test)]
    fn op_of(&self, id: &SubscriptionId) -> Option<OpCode> {
        self.entries.get(id).map(|entry| entry.op)
    }

    /// Number of subscriptions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
