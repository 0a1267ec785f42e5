//! Demo protocol shared by the `ipcmux` CLI and `ipcmux-worker`.
//!
//! The multiplexer itself lives in [`ipcmux_core`]; this crate only assigns
//! meaning to a handful of op codes.

pub use ipcmux_core;

pub mod ops {
    //! Op codes understood by `ipcmux-worker`.

    use ipcmux_core::OpCode;

    /// Parent → worker: reply with [`PONG`].
    pub const PING: OpCode = 1;
    /// Worker → parent: reply to [`PING`].
    pub const PONG: OpCode = 2;
    /// Parent → worker: exit cleanly.
    pub const SHUTDOWN: OpCode = 9;
}

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload of [`ops::PING`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    /// Sequence number echoed in the reply.
    pub seq: u64,
    /// Arbitrary data echoed in the reply.
    #[serde(default)]
    pub echo: Value,
}

/// Payload of [`ops::PONG`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    /// Process ID of the replying worker.
    pub pid: u32,
    /// Sequence number from the ping.
    pub seq: u64,
    /// Data from the ping.
    pub echo: Value,
}
