//! Typed publish/subscribe over worker channels.
//!
//! A [`Multiplexer`] tracks the worker channels it was given, decodes every
//! frame those channels (and the parent channel) receive, and fans each
//! message out to the listeners subscribed to its op code. Outbound, it
//! addresses one worker, every worker, or the parent.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::channel::{Channel, ChannelId, HandlerToken, MessageHandler, ParentLink, lock};
use crate::config::MultiplexerConfig;
use crate::message::{DecodeError, Message, OpCode, decode, encode};
use crate::registry::{Callback, ListenerRegistry, SubscriptionId, WorkerSet};

/// Observer for frames that failed to decode.
pub type DiagnosticSink = Arc<dyn Fn(&DecodeError) + Send + Sync>;

/// Where a message goes.
#[derive(Clone, Copy)]
pub enum Target<'a> {
    /// Every registered worker.
    All,
    /// The parent process, if this process has one.
    Parent,
    /// One specific channel. It does not need to be registered.
    Worker(&'a dyn Channel),
}

/// Result of [`Multiplexer::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Outcome of a send to one channel.
    Single(bool),
    /// Per-worker outcomes of a broadcast, in registration order.
    Broadcast(Vec<(ChannelId, bool)>),
}

impl SendOutcome {
    /// Whether every addressed channel accepted the message.
    ///
    /// A broadcast with no registered workers counts as success.
    pub fn succeeded(&self) -> bool {
        match self {
            Self::Single(ok) => *ok,
            Self::Broadcast(results) => results.iter().all(|(_, ok)| *ok),
        }
    }

    /// Per-worker results of a broadcast. Empty for single sends.
    pub fn results(&self) -> &[(ChannelId, bool)] {
        match self {
            Self::Single(_) => &[],
            Self::Broadcast(results) => results,
        }
    }
}

/// Pub/sub multiplexer over a pool of worker channels.
///
/// Cloning is cheap; clones share registries. Listeners run on whichever
/// thread delivered the frame, with no registry lock held, so a listener may
/// subscribe, unsubscribe, add or remove workers, and send.
///
/// Several multiplexers may share a channel. Each attaches its own handler
/// and detaches only that handler on removal or drop.
///
/// # Example
///
/// ```
/// use ipcmux_core::{MemoryChannel, Multiplexer, MultiplexerConfig, Target};
///
/// let (to_worker, worker_end) = MemoryChannel::pair();
///
/// let parent = Multiplexer::root(MultiplexerConfig::default());
/// parent.add_worker(&to_worker);
///
/// let worker = Multiplexer::new(MultiplexerConfig::default(), Some(worker_end));
/// let echo = worker.clone();
/// worker.subscribe(1, move |n: u32| {
///     echo.send(2, Target::Parent, &(n * 2));
/// });
///
/// parent.subscribe(2, |n: u32| assert_eq!(n, 42));
/// assert!(parent.send(1, Target::All, &21).succeeded());
/// ```
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

struct Inner {
    config: MultiplexerConfig,
    parent: Option<Arc<dyn Channel>>,
    listeners: Mutex<ListenerRegistry>,
    workers: Mutex<WorkerSet>,
    diagnostics: Mutex<Option<DiagnosticSink>>,
    dispatcher: MessageHandler,
    parent_token: OnceLock<HandlerToken>,
    /// Frames received while paused. `None` once dispatch is open.
    held: Mutex<Option<Vec<Vec<u8>>>>,
}

impl Multiplexer {
    /// Create a multiplexer. If `parent` is given, its frames are dispatched
    /// from now on.
    ///
    /// Frames the parent delivers before listeners are subscribed find no
    /// listener and are dropped. Use [`Multiplexer::paused`] when the parent
    /// may already be talking.
    pub fn new(config: MultiplexerConfig, parent: Option<Arc<dyn Channel>>) -> Self {
        Self::build(config, parent, false)
    }

    /// Create a multiplexer that queues every received frame until
    /// [`Multiplexer::resume`] is called.
    ///
    /// Lets a worker connect to its parent, subscribe, and only then start
    /// dispatching, without losing what the parent sent in between.
    pub fn paused(config: MultiplexerConfig, parent: Option<Arc<dyn Channel>>) -> Self {
        Self::build(config, parent, true)
    }

    fn build(config: MultiplexerConfig, parent: Option<Arc<dyn Channel>>, paused: bool) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let dispatcher: MessageHandler = Arc::new(move |frame: &[u8]| {
                if let Some(inner) = weak.upgrade() {
                    inner.receive(frame);
                }
            });

            Inner {
                config,
                parent,
                listeners: Mutex::new(ListenerRegistry::new()),
                workers: Mutex::new(WorkerSet::new()),
                diagnostics: Mutex::new(None),
                dispatcher,
                parent_token: OnceLock::new(),
                held: Mutex::new(paused.then(Vec::new)),
            }
        });

        if let Some(parent) = &inner.parent {
            let token = parent.add_message_handler(Arc::clone(&inner.dispatcher));
            let _ = inner.parent_token.set(token);
            tracing::debug!("Listening on parent channel {}", parent.id());
        }

        Self { inner }
    }

    /// Create a multiplexer for a process with no parent.
    pub fn root(config: MultiplexerConfig) -> Self {
        Self::new(config, None)
    }

    /// Create a multiplexer, connecting to the parent if this process was
    /// spawned as a worker.
    pub fn from_env(config: MultiplexerConfig) -> Self {
        Self::new(config, ParentLink::detect())
    }

    /// Whether closed workers are deregistered automatically.
    pub fn auto_remove(&self) -> bool {
        self.inner.config.auto_remove
    }

    /// Whether this multiplexer has a parent channel.
    pub fn has_parent(&self) -> bool {
        self.inner.parent.is_some()
    }

    /// Whether received frames are being queued instead of dispatched.
    pub fn is_paused(&self) -> bool {
        lock(&self.inner.held).is_some()
    }

    /// Dispatch every queued frame in arrival order and stop queueing.
    ///
    /// Returns the number of queued frames dispatched. Frames arriving while
    /// the queue drains are dispatched after it. No-op if not paused.
    pub fn resume(&self) -> usize {
        let mut drained = 0;
        loop {
            let queued = {
                let mut held = lock(&self.inner.held);
                match held.as_mut() {
                    None => return drained,
                    Some(queue) if queue.is_empty() => {
                        *held = None;
                        tracing::debug!("Resumed dispatch after {} queued frame(s)", drained);
                        return drained;
                    }
                    Some(queue) => std::mem::take(queue),
                }
            };
            for frame in &queued {
                self.inner.dispatch(frame);
            }
            drained += queued.len();
        }
    }

    // =========================================================================
    // Workers
    // =========================================================================

    /// Register a worker channel and start dispatching its frames.
    ///
    /// No-op if the channel is already registered.
    pub fn add_worker(&self, channel: &Arc<dyn Channel>) {
        let id = channel.id();
        if lock(&self.inner.workers).contains(id) {
            return;
        }

        let message_token = channel.add_message_handler(Arc::clone(&self.inner.dispatcher));
        if !lock(&self.inner.workers).insert(Arc::clone(channel), message_token) {
            // Lost a race with a concurrent add of the same channel.
            channel.remove_message_handler(message_token);
            return;
        }
        tracing::debug!("Registered worker channel {}", id);

        if self.inner.config.auto_remove {
            let weak = Arc::downgrade(&self.inner);
            // May fire immediately, so no registry lock is held here.
            let close_token = channel.on_close(Box::new(move |id| {
                if let Some(inner) = weak.upgrade() {
                    inner.remove_worker(id);
                }
            }));
            if !lock(&self.inner.workers).set_close_token(id, close_token) {
                channel.remove_close_handler(close_token);
            }
        }
    }

    /// Deregister a worker channel and stop dispatching its frames.
    ///
    /// Returns whether it was registered. The channel itself stays open.
    pub fn remove_worker(&self, channel: &Arc<dyn Channel>) -> bool {
        self.inner.remove_worker(channel.id())
    }

    /// Deregister a worker by identity.
    pub fn remove_worker_id(&self, id: ChannelId) -> bool {
        self.inner.remove_worker(id)
    }

    /// Whether a channel is registered as a worker.
    pub fn contains_worker(&self, id: ChannelId) -> bool {
        lock(&self.inner.workers).contains(id)
    }

    /// Identities of the registered workers in registration order.
    pub fn worker_ids(&self) -> Vec<ChannelId> {
        lock(&self.inner.workers).ids()
    }

    /// Number of registered workers.
    pub fn worker_count(&self) -> usize {
        lock(&self.inner.workers).len()
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Subscribe to `op` with a typed payload.
    ///
    /// Messages whose payload does not deserialize into `T` are skipped by
    /// this listener only.
    pub fn subscribe<T, F>(&self, op: OpCode, callback: F) -> SubscriptionId
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.subscribe_message(op, move |message: &Message| {
            match T::deserialize(&message.d) {
                Ok(payload) => callback(payload),
                Err(e) => tracing::debug!(
                    "Skipping listener on op {}: payload does not match ({})",
                    message.op,
                    e
                ),
            }
        })
    }

    /// Subscribe to `op` with the raw payload.
    pub fn subscribe_raw<F>(&self, op: OpCode, callback: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe_message(op, move |message: &Message| callback(&message.d))
    }

    /// Subscribe to `op` with the full message envelope.
    pub fn subscribe_message<F>(&self, op: OpCode, callback: F) -> SubscriptionId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let id = lock(&self.inner.listeners).insert(op, callback);
        tracing::debug!("Subscribed {} to op {}", id, op);
        id
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let removed = lock(&self.inner.listeners).remove(id);
        if removed {
            tracing::debug!("Unsubscribed {}", id);
        }
        removed
    }

    /// Remove every subscription on `op`. Returns how many were removed.
    pub fn unsubscribe_op(&self, op: OpCode) -> usize {
        let removed = lock(&self.inner.listeners).remove_op(op);
        if removed > 0 {
            tracing::debug!("Removed {} listener(s) on op {}", removed, op);
        }
        removed
    }

    /// Number of subscriptions.
    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    /// Observe frames that fail to decode. Dispatch still drops them.
    pub fn set_diagnostic_sink<F>(&self, sink: F)
    where
        F: Fn(&DecodeError) + Send + Sync + 'static,
    {
        *lock(&self.inner.diagnostics) = Some(Arc::new(sink));
    }

    // =========================================================================
    // Dispatch & send
    // =========================================================================

    /// Decode a frame and invoke every listener on its op code.
    ///
    /// Channels call this automatically; it is public for frames that arrive
    /// through other transports, and is never queued by a paused
    /// multiplexer. Returns the number of listeners invoked. Frames that are
    /// not valid envelopes invoke nothing.
    pub fn dispatch(&self, frame: &[u8]) -> usize {
        self.inner.dispatch(frame)
    }

    /// Send `{op, d: payload}` to `target`.
    ///
    /// Never fails outright: unreachable or failing channels are reported as
    /// `false`. A payload that cannot be serialized fails every target.
    pub fn send<T: Serialize + ?Sized>(
        &self,
        op: OpCode,
        target: Target<'_>,
        payload: &T,
    ) -> SendOutcome {
        let frame = match encode(op, payload) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::warn!("Failed to encode payload for op {}: {}", op, e);
                None
            }
        };
        let frame = frame.as_deref();

        match target {
            Target::All => {
                let workers = lock(&self.inner.workers).snapshot();
                let results = workers
                    .iter()
                    .map(|worker| (worker.id(), send_frame(worker.as_ref(), op, frame)))
                    .collect();
                SendOutcome::Broadcast(results)
            }
            Target::Parent => match &self.inner.parent {
                Some(parent) => SendOutcome::Single(send_frame(parent.as_ref(), op, frame)),
                None => {
                    tracing::debug!("No parent channel; dropping op {}", op);
                    SendOutcome::Single(false)
                }
            },
            Target::Worker(channel) => SendOutcome::Single(send_frame(channel, op, frame)),
        }
    }

    /// Send to every registered worker.
    pub fn broadcast<T: Serialize + ?Sized>(
        &self,
        op: OpCode,
        payload: &T,
    ) -> Vec<(ChannelId, bool)> {
        match self.send(op, Target::All, payload) {
            SendOutcome::Broadcast(results) => results,
            SendOutcome::Single(_) => Vec::new(),
        }
    }

    /// Send to the parent.
    pub fn send_to_parent<T: Serialize + ?Sized>(&self, op: OpCode, payload: &T) -> bool {
        self.send(op, Target::Parent, payload).succeeded()
    }

    /// Send to one channel.
    pub fn send_to<T: Serialize + ?Sized>(
        &self,
        channel: &dyn Channel,
        op: OpCode,
        payload: &T,
    ) -> bool {
        self.send(op, Target::Worker(channel), payload).succeeded()
    }
}

fn send_frame(channel: &dyn Channel, op: OpCode, frame: Option<&[u8]>) -> bool {
    let Some(frame) = frame else {
        return false;
    };

    let sent = panic::catch_unwind(AssertUnwindSafe(|| channel.send(frame))).unwrap_or_else(|e| {
        tracing::error!(
            "Channel {} panicked while sending: {}",
            channel.id(),
            panic_message(&*e)
        );
        false
    });
    if !sent {
        tracing::debug!("Send of op {} to channel {} failed", op, channel.id());
    }
    sent
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

impl Inner {
    fn receive(&self, frame: &[u8]) {
        {
            let mut held = lock(&self.held);
            if let Some(queue) = held.as_mut() {
                queue.push(frame.to_vec());
                return;
            }
        }
        self.dispatch(frame);
    }

    fn dispatch(&self, frame: &[u8]) -> usize {
        let message = match decode(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::trace!("Dropping {}-byte frame: {}", frame.len(), e);
                let sink = lock(&self.diagnostics).clone();
                if let Some(sink) = sink {
                    sink(&e);
                }
                return 0;
            }
        };

        // Snapshot so listeners can change the registry mid-dispatch.
        let callbacks = lock(&self.listeners).matching(message.op);
        for callback in &callbacks {
            if let Err(e) = panic::catch_unwind(AssertUnwindSafe(|| callback(&message))) {
                tracing::error!(
                    "Listener on op {} panicked: {}",
                    message.op,
                    panic_message(&*e)
                );
            }
        }
        callbacks.len()
    }

    fn remove_worker(&self, id: ChannelId) -> bool {
        let removed = lock(&self.workers).remove(id);
        match removed {
            Some(entry) => {
                entry.detach();
                tracing::debug!("Removed worker channel {}", id);
                true
            }
            None => false,
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let (Some(parent), Some(token)) = (&self.parent, self.parent_token.get()) {
            parent.remove_message_handler(*token);
        }
        let workers = self
            .workers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain();
        for worker in workers {
            worker.detach();
        }
    }
}
