//! Request dispatch.
//!
//! Maps a decoded request onto its handler and produces the reply frame.
//! Handlers never fail: every error becomes a response envelope correlated
//! by `event_id`.

pub mod eval;
pub mod fetch;

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::host::{Evaluator, Fetcher};
use crate::transport::protocol::{Action, Request, Response};
use crate::transport::{self, FrameError};

/// A response control block plus its optional binary payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub response: Response,
    pub payload: Option<Vec<u8>>,
}

impl Reply {
    pub const fn control(response: Response) -> Self {
        Self {
            response,
            payload: None,
        }
    }

    /// Encode as a frame ready for the socket.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        transport::encode(&self.response, self.payload.as_deref())
    }
}

/// Routes requests to the host capabilities.
#[derive(Clone)]
pub struct Dispatcher {
    fetcher: Arc<dyn Fetcher>,
    evaluator: Arc<dyn Evaluator>,
}

impl Dispatcher {
    pub fn new(fetcher: Arc<dyn Fetcher>, evaluator: Arc<dyn Evaluator>) -> Self {
        Self { fetcher, evaluator }
    }

    /// Run one request to completion.
    ///
    /// Returns `None` for `close_ws`, which the connection handles itself.
    pub async fn dispatch(
        &self,
        event_id: Value,
        request: Request,
        payload: Option<Vec<u8>>,
    ) -> Option<Reply> {
        let reply = match request {
            Request::Fetch(params) => {
                fetch::handle(self.fetcher.as_ref(), event_id, params, payload).await
            }
            Request::Eval(params) => eval::handle(self.evaluator.as_ref(), event_id, params).await,
            Request::Invalid { action, message } => {
                warn!(?action, error = %message, "Invalid request parameters");
                match action {
                    Action::Fetch => Reply::control(Response::error(event_id, message)),
                    Action::Eval => Reply::control(Response::Evaluated {
                        event_id,
                        result: Value::String(message),
                    }),
                }
            }
            Request::Unknown { action } => {
                debug!(action = %action, "Unknown action");
                Reply::control(Response::unknown_action(event_id, &action))
            }
            Request::CloseWs { .. } => return None,
        };
        Some(reply)
    }
}
