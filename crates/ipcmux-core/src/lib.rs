//! Typed publish/subscribe multiplexer for parent/worker IPC.
//!
//! This crate provides:
//! - Channel handles over in-process pairs, child processes, and stdio
//! - A listener registry keyed by subscription id and indexed by op code
//! - A worker registry with optional removal on channel close
//! - Unicast, broadcast, and parent-bound sends of `{"op", "d"}` messages

pub mod channel;
pub mod config;
pub mod error;
pub mod framing;
pub mod message;
pub mod multiplexer;
pub mod registry;

pub use channel::{
    Channel, ChannelId, CloseHandler, HandlerToken, MemoryChannel, MessageHandler, ParentLink,
    ProcessChannel, StdioChannel,
};
pub use config::{MultiplexerConfig, SpawnConfig, find_worker_binary};
pub use error::{Error, Result};
pub use message::{DecodeError, Message, OpCode, decode, encode};
pub use multiplexer::{DiagnosticSink, Multiplexer, SendOutcome, Target};
pub use registry::SubscriptionId;
