//! browserfetch agent library
//!
//! An agent that keeps a WebSocket open to a local control server and, on
//! command, performs HTTP retrievals or script evaluation through the host's
//! live session, sending results (and binary bodies) back on the same socket:
//! - Frame codec and request/response envelopes
//! - Connection manager with handshake and fixed-delay reconnect
//! - `fetch` and `eval` handlers over pluggable host capabilities

pub mod config;
pub mod handlers;
pub mod host;
pub mod transport;

pub use transport::{Agent, AgentHandle, SessionEnd};
