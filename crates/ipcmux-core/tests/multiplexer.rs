//! Integration tests for the multiplexer over in-process channels.
//!
//! Covers dispatch, registry idempotence, broadcast aggregation, parent
//! addressing, auto-remove on close, and channels shared between
//! multiplexers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ipcmux_core::{
    Channel, ChannelId, CloseHandler, HandlerToken, MemoryChannel, MessageHandler, Multiplexer,
    MultiplexerConfig, SendOutcome, Target,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// =============================================================================
// Test Helpers
// =============================================================================

/// A registered worker: the parent's end plus a recorder on the far end.
struct TestWorker {
    channel: Arc<dyn Channel>,
    peer: Arc<dyn Channel>,
    received: Arc<Mutex<Vec<Value>>>,
}

impl TestWorker {
    fn new() -> Self {
        let (channel, peer) = MemoryChannel::pair();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        peer.add_message_handler(Arc::new(move |frame: &[u8]| {
            sink.lock()
                .unwrap()
                .push(serde_json::from_slice(frame).unwrap());
        }));

        Self {
            channel,
            peer,
            received,
        }
    }

    fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }
}

/// A channel whose sends always fail. Tracks which handlers are attached.
struct RejectingChannel {
    id: ChannelId,
    attempts: AtomicUsize,
    message_handlers: Mutex<Vec<HandlerToken>>,
    close_handlers: Mutex<Vec<HandlerToken>>,
}

impl RejectingChannel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ChannelId::next(),
            attempts: AtomicUsize::new(0),
            message_handlers: Mutex::new(Vec::new()),
            close_handlers: Mutex::new(Vec::new()),
        })
    }

    fn handler_counts(&self) -> (usize, usize) {
        (
            self.message_handlers.lock().unwrap().len(),
            self.close_handlers.lock().unwrap().len(),
        )
    }
}

impl Channel for RejectingChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send(&self, _frame: &[u8]) -> bool {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        false
    }

    fn add_message_handler(&self, _handler: MessageHandler) -> HandlerToken {
        let token = HandlerToken::next();
        self.message_handlers.lock().unwrap().push(token);
        token
    }

    fn remove_message_handler(&self, token: HandlerToken) {
        self.message_handlers.lock().unwrap().retain(|t| *t != token);
    }

    fn on_close(&self, _handler: CloseHandler) -> HandlerToken {
        let token = HandlerToken::next();
        self.close_handlers.lock().unwrap().push(token);
        token
    }

    fn remove_close_handler(&self, token: HandlerToken) {
        self.close_handlers.lock().unwrap().retain(|t| *t != token);
    }

    fn is_closed(&self) -> bool {
        false
    }

    fn close(&self) {}
}

fn counter(mux: &Multiplexer, op: i64) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    mux.subscribe_raw(op, move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    count
}

// =============================================================================
// Dispatch
// =============================================================================

#[test]
fn test_dispatch_reaches_every_matching_listener_once() {
    let mux = Multiplexer::root(MultiplexerConfig::default());
    let worker = TestWorker::new();
    mux.add_worker(&worker.channel);

    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));
    for seen in [&first, &second] {
        let seen = Arc::clone(seen);
        mux.subscribe_raw(7, move |payload| seen.lock().unwrap().push(payload.clone()));
    }
    let other = counter(&mux, 8);

    assert!(worker.peer.send(br#"{"op": 7, "d": {"value": 1}}"#));

    assert_eq!(*first.lock().unwrap(), vec![json!({"value": 1})]);
    assert_eq!(*second.lock().unwrap(), vec![json!({"value": 1})]);
    assert_eq!(other.load(Ordering::SeqCst), 0);
}

#[test]
fn test_non_protocol_traffic_is_ignored() {
    let mux = Multiplexer::root(MultiplexerConfig::default());
    let worker = TestWorker::new();
    mux.add_worker(&worker.channel);
    let count = counter(&mux, 1);

    for frame in [&b"hello"[..], br#"{"op": 1, "d""#, b"42", br#"{"d": 1}"#] {
        assert!(worker.peer.send(frame));
    }
    assert_eq!(count.load(Ordering::SeqCst), 0);

    worker.peer.send(br#"{"op": 1, "d": null}"#);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_typed_round_trip_between_multiplexers() {
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Job {
        id: u32,
        tags: Vec<String>,
    }

    let (to_worker, worker_end) = MemoryChannel::pair();
    let parent = Multiplexer::root(MultiplexerConfig::default());
    parent.add_worker(&to_worker);

    let worker = Multiplexer::new(MultiplexerConfig::default(), Some(worker_end));
    let reply = worker.clone();
    worker.subscribe(10, move |job: Job| {
        reply.send_to_parent(11, &job);
    });

    let results = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&results);
    parent.subscribe(11, move |job: Job| r.lock().unwrap().push(job));

    let job = Job {
        id: 3,
        tags: vec!["a".to_string(), "b".to_string()],
    };
    assert!(parent.send(10, Target::All, &job).succeeded());
    assert_eq!(*results.lock().unwrap(), vec![job]);
}

// =============================================================================
// Registries
// =============================================================================

#[test]
fn test_remove_worker_twice_is_a_no_op() {
    let mux = Multiplexer::root(MultiplexerConfig::default());
    let worker = TestWorker::new();
    mux.add_worker(&worker.channel);
    mux.add_worker(&worker.channel);
    assert_eq!(mux.worker_count(), 1);

    assert!(mux.remove_worker(&worker.channel));
    assert!(!mux.remove_worker(&worker.channel));
    assert_eq!(mux.worker_count(), 0);

    // Frames from a removed worker are no longer dispatched.
    let count = counter(&mux, 1);
    worker.peer.send(br#"{"op": 1, "d": null}"#);
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn test_unsubscribe_twice_is_a_no_op() {
    let mux = Multiplexer::root(MultiplexerConfig::default());
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    let id = mux.subscribe_raw(2, move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    let kept = counter(&mux, 2);

    assert!(mux.unsubscribe(&id));
    assert!(!mux.unsubscribe(&id));

    mux.dispatch(br#"{"op": 2, "d": null}"#);
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(kept.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unsubscribe_op_removes_all_on_that_op() {
    let mux = Multiplexer::root(MultiplexerConfig::default());
    let a = counter(&mux, 5);
    let b = counter(&mux, 5);
    let c = counter(&mux, 6);

    assert_eq!(mux.unsubscribe_op(5), 2);
    assert_eq!(mux.unsubscribe_op(5), 0);
    assert_eq!(mux.listener_count(), 1);

    mux.dispatch(br#"{"op": 5, "d": null}"#);
    mux.dispatch(br#"{"op": 6, "d": null}"#);
    assert_eq!(a.load(Ordering::SeqCst), 0);
    assert_eq!(b.load(Ordering::SeqCst), 0);
    assert_eq!(c.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Send
// =============================================================================

#[test]
fn test_broadcast_reports_each_worker_in_registration_order() {
    let mux = Multiplexer::root(MultiplexerConfig::default());
    let a = TestWorker::new();
    let b = TestWorker::new();
    let c = TestWorker::new();
    for worker in [&a, &b, &c] {
        mux.add_worker(&worker.channel);
    }
    b.peer.close();

    let outcome = mux.send(4, Target::All, &json!("hi"));
    assert_eq!(
        outcome,
        SendOutcome::Broadcast(vec![
            (a.channel.id(), true),
            (b.channel.id(), false),
            (c.channel.id(), true),
        ])
    );
    assert!(!outcome.succeeded());
    assert_eq!(a.received(), vec![json!({"op": 4, "d": "hi"})]);
    assert!(b.received().is_empty());
    assert_eq!(c.received(), vec![json!({"op": 4, "d": "hi"})]);
}

#[test]
fn test_broadcast_with_rejecting_transport() {
    let mux = Multiplexer::root(MultiplexerConfig::default());
    let good = TestWorker::new();
    let bad = RejectingChannel::new();
    let bad_channel: Arc<dyn Channel> = bad.clone();
    mux.add_worker(&good.channel);
    mux.add_worker(&bad_channel);

    let results = mux.broadcast(1, &[1, 2, 3]);
    assert_eq!(
        results,
        vec![(good.channel.id(), true), (bad_channel.id(), false)]
    );
    assert_eq!(bad.attempts.load(Ordering::SeqCst), 1);
}

#[test]
fn test_broadcast_to_no_workers() {
    let mux = Multiplexer::root(MultiplexerConfig::default());
    let outcome = mux.send(1, Target::All, &());
    assert_eq!(outcome, SendOutcome::Broadcast(Vec::new()));
}

#[test]
fn test_parent_send_without_parent_returns_false() {
    let mux = Multiplexer::root(MultiplexerConfig::default());
    assert!(!mux.has_parent());
    assert_eq!(mux.send(1, Target::Parent, &"up"), SendOutcome::Single(false));
    assert!(!mux.send_to_parent(1, &"up"));
}

#[test]
fn test_parent_send_with_parent() {
    let (parent_end, child_end) = MemoryChannel::pair();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    parent_end.add_message_handler(Arc::new(move |frame: &[u8]| {
        sink.lock().unwrap().push(frame.to_vec());
    }));

    let mux = Multiplexer::new(MultiplexerConfig::default(), Some(child_end));
    assert!(mux.has_parent());
    assert_eq!(mux.send(9, Target::Parent, &true), SendOutcome::Single(true));
    assert_eq!(*received.lock().unwrap(), vec![br#"{"op":9,"d":true}"#.to_vec()]);
}

#[test]
fn test_direct_send_bypasses_registry() {
    let mux = Multiplexer::root(MultiplexerConfig::default());
    let unregistered = TestWorker::new();

    let outcome = mux.send(3, Target::Worker(unregistered.channel.as_ref()), &5);
    assert_eq!(outcome, SendOutcome::Single(true));
    assert_eq!(unregistered.received(), vec![json!({"op": 3, "d": 5})]);
    assert_eq!(mux.worker_count(), 0);

    let rejecting = RejectingChannel::new();
    assert!(!mux.send_to(rejecting.as_ref(), 3, &5));
}

// =============================================================================
// Auto-remove
// =============================================================================

#[test]
fn test_auto_remove_on_close() {
    let mux = Multiplexer::root(MultiplexerConfig::default().with_auto_remove(true));
    assert!(mux.auto_remove());
    let a = TestWorker::new();
    let b = TestWorker::new();
    mux.add_worker(&a.channel);
    mux.add_worker(&b.channel);

    a.peer.close();

    assert!(!mux.contains_worker(a.channel.id()));
    assert_eq!(mux.worker_ids(), vec![b.channel.id()]);
    assert_eq!(
        mux.send(1, Target::All, &()),
        SendOutcome::Broadcast(vec![(b.channel.id(), true)])
    );

    // The close handler already ran; an explicit removal is still a no-op.
    assert!(!mux.remove_worker(&a.channel));
}

#[test]
fn test_closed_worker_stays_without_auto_remove() {
    let mux = Multiplexer::root(MultiplexerConfig::default());
    let a = TestWorker::new();
    mux.add_worker(&a.channel);

    a.peer.close();

    assert!(mux.contains_worker(a.channel.id()));
    assert_eq!(
        mux.send(1, Target::All, &()),
        SendOutcome::Broadcast(vec![(a.channel.id(), false)])
    );
}

#[test]
fn test_auto_remove_of_already_closed_channel() {
    let mux = Multiplexer::root(MultiplexerConfig::default().with_auto_remove(true));
    let a = TestWorker::new();
    a.channel.close();

    mux.add_worker(&a.channel);
    assert_eq!(mux.worker_count(), 0);
}

#[test]
fn test_listener_may_add_workers_during_dispatch() {
    let mux = Multiplexer::root(MultiplexerConfig::default());
    let a = TestWorker::new();
    let late = TestWorker::new();
    mux.add_worker(&a.channel);

    let handle = mux.clone();
    let late_channel = Arc::clone(&late.channel);
    mux.subscribe_raw(1, move |_| {
        handle.add_worker(&late_channel);
        handle.send(2, Target::All, &());
    });

    a.peer.send(br#"{"op": 1, "d": null}"#);

    assert_eq!(mux.worker_count(), 2);
    assert_eq!(a.received(), vec![json!({"op": 2, "d": null})]);
    assert_eq!(late.received(), vec![json!({"op": 2, "d": null})]);
}

#[test]
fn test_re_adding_a_worker_does_not_accumulate_handlers() {
    let mux = Multiplexer::root(MultiplexerConfig::default().with_auto_remove(true));
    let rejecting = RejectingChannel::new();
    let channel: Arc<dyn Channel> = rejecting.clone();

    for _ in 0..50 {
        mux.add_worker(&channel);
        mux.add_worker(&channel);
        assert_eq!(rejecting.handler_counts(), (1, 1));
        assert!(mux.remove_worker(&channel));
        assert_eq!(rejecting.handler_counts(), (0, 0));
    }

    mux.add_worker(&channel);
    drop(mux);
    assert_eq!(rejecting.handler_counts(), (0, 0));
}

// =============================================================================
// Shared channels
// =============================================================================

#[test]
fn test_worker_shared_by_two_multiplexers() {
    let worker = TestWorker::new();
    let first = Multiplexer::root(MultiplexerConfig::default().with_auto_remove(true));
    let second = Multiplexer::root(MultiplexerConfig::default().with_auto_remove(true));
    first.add_worker(&worker.channel);
    second.add_worker(&worker.channel);
    let first_count = counter(&first, 1);
    let second_count = counter(&second, 1);

    // Removing from one leaves the other dispatching.
    assert!(second.remove_worker(&worker.channel));
    worker.peer.send(br#"{"op": 1, "d": null}"#);
    assert_eq!(first_count.load(Ordering::SeqCst), 1);
    assert_eq!(second_count.load(Ordering::SeqCst), 0);

    // Only the multiplexer still holding the worker reacts to its close.
    second.add_worker(&worker.channel);
    assert!(second.remove_worker(&worker.channel));
    worker.peer.close();
    assert_eq!(first.worker_count(), 0);
    assert_eq!(second.worker_count(), 0);
}

#[test]
fn test_parent_frames_sent_before_subscribing_are_not_lost() {
    let (parent_end, child_end) = MemoryChannel::pair();
    let worker = Multiplexer::paused(MultiplexerConfig::default(), Some(child_end));

    // Parent pings as soon as the child is connected.
    assert!(parent_end.send(br#"{"op": 1, "d": {"seq": 0}}"#));

    let replies = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&replies);
    parent_end.add_message_handler(Arc::new(move |frame: &[u8]| {
        sink.lock()
            .unwrap()
            .push(serde_json::from_slice::<Value>(frame).unwrap());
    }));

    let reply = worker.clone();
    worker.subscribe_raw(1, move |payload| {
        reply.send_to_parent(2, payload);
    });
    assert!(replies.lock().unwrap().is_empty());

    assert_eq!(worker.resume(), 1);
    assert_eq!(
        *replies.lock().unwrap(),
        vec![json!({"op": 2, "d": {"seq": 0}})]
    );
}
