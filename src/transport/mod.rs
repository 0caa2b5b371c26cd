//! Transport layer for agent ↔ control-server communication.
//!
//! Every message after the handshake is a frame:
//! `[UTF-8 JSON control block][0x00][raw binary payload]`.
//! A message without a `0x00` byte is a bare control block with no payload.
//! `connection` owns the WebSocket and the reconnect loop.

pub mod connection;
pub mod protocol;

pub use connection::{Agent, AgentHandle, SessionEnd};
pub use protocol::{Request, RequestEnvelope};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Separator between the control block and the binary payload.
const SEPARATOR: u8 = 0;

/// Failures of the frame codec.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The control segment is not valid JSON.
    #[error("invalid control block: {0}")]
    Parse(#[from] serde_json::Error),

    /// The control block did not serialize to a JSON object.
    #[error("control block must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// One decoded message: control block plus optional binary payload.
///
/// `payload` is `None` when the message had no separator at all, and
/// `Some(vec![])` when the separator was present but nothing followed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub control: Value,
    pub payload: Option<Vec<u8>>,
}

/// Encode a control block and optional payload into one message.
///
/// The control block must serialize to a JSON object; serde_json never emits
/// a raw NUL inside a string, so the first zero byte is always the separator.
pub fn encode<T: Serialize>(control: &T, payload: Option<&[u8]>) -> Result<Vec<u8>, FrameError> {
    let value = serde_json::to_value(control)?;
    if !value.is_object() {
        return Err(FrameError::NotAnObject(json_kind(&value)));
    }

    let mut bytes = serde_json::to_vec(&value)?;
    if let Some(payload) = payload {
        bytes.reserve(payload.len() + 1);
        bytes.push(SEPARATOR);
        bytes.extend_from_slice(payload);
    }
    Ok(bytes)
}

/// Decode a message, splitting on the first zero byte.
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    let (control, payload) = match bytes.iter().position(|&b| b == SEPARATOR) {
        Some(idx) => (&bytes[..idx], Some(bytes[idx + 1..].to_vec())),
        None => (bytes, None),
    };

    Ok(Frame {
        control: serde_json::from_slice(control)?,
        payload,
    })
}

/// Handshake line sent once per connection: `"<version> <host_id>"`.
pub fn handshake(protocol_version: &str, host_id: &str) -> String {
    format!("{protocol_version} {host_id}")
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
