//! Registries owned by a multiplexer.

mod listeners;
mod workers;

pub use listeners::{Callback, ListenerRegistry, SubscriptionId};
pub use workers::{WorkerEntry, WorkerSet};
