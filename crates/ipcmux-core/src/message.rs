//! Wire envelope for multiplexed messages.
//!
//! Every message is a JSON object of the exact shape `{"op": <int>, "d": <any>}`.
//! There is no version field and no length prefix; framing is the channel's job.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Numeric operation code identifying the logical event type.
pub type OpCode = i64;

/// A decoded message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The operation code.
    pub op: OpCode,
    /// The payload. Opaque to the multiplexer.
    #[serde(default)]
    pub d: Value,
}

impl Message {
    /// Create a new message.
    pub fn new(op: OpCode, d: Value) -> Self {
        Self { op, d }
    }

    /// Decode the payload into a concrete type.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.d)
    }
}

/// Why an incoming frame was not a valid envelope.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The frame was not parseable as an envelope.
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame parsed as JSON but is not an object.
    #[error("message is not an object")]
    NotAnEnvelope,
}

/// Serialize `{op, d}` into a frame.
///
/// Borrows the payload so broadcasts can encode once without cloning.
pub fn encode<T: Serialize + ?Sized>(op: OpCode, payload: &T) -> serde_json::Result<Vec<u8>> {
    #[derive(Serialize)]
    struct Envelope<'a, T: ?Sized> {
        op: OpCode,
        d: &'a T,
    }

    serde_json::to_vec(&Envelope { op, d: payload })
}

/// Parse a frame into a message.
pub fn decode(frame: &[u8]) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_slice(frame)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnEnvelope);
    }
    Ok(Message::deserialize(value)?)
}
