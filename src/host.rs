//! Host capabilities the agent relays requests into.
//!
//! The agent itself owns no network session or script engine. A `Fetcher`
//! performs HTTP requests with the host's ambient session (cookies, TLS
//! state) and an `Evaluator` runs script text in the host context.

mod http;
mod process;

pub use http::HttpFetcher;
pub use process::ProcessEvaluator;

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::transport::protocol::FetchOptions;

/// An HTTP request to run through the host session.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub options: FetchOptions,
    /// Raw body from the frame payload; wins over `options.body`.
    pub body: Option<Vec<u8>>,
}

/// Response metadata and body as seen by the host client.
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    /// Header entries in the order the client yields them.
    pub headers: Vec<(String, String)>,
    pub ok: bool,
    pub redirected: bool,
    pub status: u16,
    pub status_text: String,
    /// Response type: `basic`, `cors`, `opaque`, `opaqueredirect`, `error`.
    pub kind: String,
    /// Final URL after redirects.
    pub url: String,
    pub body: Vec<u8>,
}

/// Host network client.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Execute the request. Dropping the future aborts it.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse>;
}

/// A deferred evaluation outcome.
pub type Deferred = BoxFuture<'static, Result<Evaluated>>;

/// A callable evaluation outcome; invoked with the request's `arg`.
pub type Callable = Box<dyn FnOnce(Option<Value>) -> Result<Evaluated> + Send>;

/// What evaluating script text produced.
pub enum Evaluated {
    /// A plain, already-serializable value.
    Value(Value),
    /// A computation that has not settled yet.
    Deferred(Deferred),
    /// A function awaiting its argument.
    Callable(Callable),
}

impl fmt::Debug for Evaluated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Deferred(_) => f.write_str("Deferred"),
            Self::Callable(_) => f.write_str("Callable"),
        }
    }
}

impl From<Value> for Evaluated {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// Host script engine.
///
/// No sandboxing is applied: the peer is trusted to run arbitrary code.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, script: &str) -> Result<Evaluated>;
}
