//! WebSocket connection to the control server.
//!
//! One connection at a time: connect, send the handshake, then decode each
//! inbound frame and run its request as an independent task. Replies may go
//! out in any order; the peer correlates them by `event_id`. When the socket
//! drops, the agent waits a fixed delay and connects again, forever, until
//! the peer sends `close_ws` or the handle is stopped.

use std::sync::Arc;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::protocol::{Request, RequestEnvelope};
use crate::config::{AgentConfig, ConfigError};
use crate::handlers::Dispatcher;
use crate::host::{Evaluator, Fetcher, HttpFetcher, ProcessEvaluator};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Socket-level failures. These only ever lead to a reconnect.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("failed to send handshake: {0}")]
    Handshake(#[source] tungstenite::Error),

    #[error("connection lost: {0}")]
    Lost(String),
}

/// Why the agent stopped for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer sent `close_ws`.
    PeerClosed { reason: Option<String> },
    /// The local handle asked the agent to stop.
    Stopped,
}

/// Serialized write half of the socket.
///
/// Handler tasks complete concurrently; the mutex keeps whole frames from
/// interleaving on the wire.
#[derive(Clone)]
struct FrameWriter {
    sink: Arc<Mutex<SplitSink<WsStream, Message>>>,
}

impl FrameWriter {
    fn new(sink: SplitSink<WsStream, Message>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    async fn send(&self, message: Message) -> Result<(), tungstenite::Error> {
        self.sink.lock().await.send(message).await
    }

    async fn close(&self) {
        if let Err(e) = self.sink.lock().await.close().await {
            debug!(error = %e, "Error while closing socket");
        }
    }
}

/// The agent: configuration plus the handlers requests are routed to.
pub struct Agent {
    config: Arc<AgentConfig>,
    dispatcher: Dispatcher,
}

impl Agent {
    /// Create an agent over the given host capabilities.
    pub fn new(
        config: AgentConfig,
        fetcher: Arc<dyn Fetcher>,
        evaluator: Arc<dyn Evaluator>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            dispatcher: Dispatcher::new(fetcher, evaluator),
        })
    }

    /// Create an agent with the default `reqwest` fetcher and process evaluator.
    pub fn from_config(config: AgentConfig) -> anyhow::Result<Self> {
        let fetcher = HttpFetcher::from_config(&config)?;
        let evaluator = ProcessEvaluator::new(&config.evaluator.command)?;
        Ok(Self::new(config, Arc::new(fetcher), Arc::new(evaluator))?)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Spawn the connect/reconnect loop.
    pub fn start(self) -> AgentHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));
        AgentHandle {
            stop: stop_tx,
            task,
        }
    }

    /// Run until the peer closes the session or `stop` flips to true.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> SessionEnd {
        let delay = self.config.reconnect_delay();
        loop {
            match self.connect_once(&mut stop).await {
                Ok(end) => {
                    info!(?end, "Agent finished");
                    return end;
                }
                Err(e) => warn!(error = %e, "browserfetch: websocket was closed"),
            }

            info!(delay_ms = delay.as_millis(), "Reconnecting after delay");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = stopped(&mut stop) => return SessionEnd::Stopped,
            }
        }
    }

    /// One connection lifetime. `Err` means "lost, try again".
    async fn connect_once(
        &self,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, TransportError> {
        let endpoint = self.config.endpoint.as_str();
        debug!(endpoint, "Connecting");

        let ws = tokio::select! {
            result = connect_async(endpoint) => result
                .map_err(|source| TransportError::Connect {
                    endpoint: endpoint.to_owned(),
                    source,
                })?
                .0,
            () = stopped(stop) => return Ok(SessionEnd::Stopped),
        };

        let (sink, mut stream) = ws.split();
        let writer = FrameWriter::new(sink);
        writer
            .send(Message::text(super::handshake(
                &self.config.protocol_version,
                &self.config.host_id,
            )))
            .await
            .map_err(TransportError::Handshake)?;
        info!(endpoint, host_id = %self.config.host_id, "Connected");

        // Tied to this connection: replies cannot be delivered on a new socket.
        let mut in_flight = JoinSet::new();

        let end = loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(Ok(Message::Binary(bytes))) => {
                        if let Some(end) = self.on_frame(&bytes, &writer, &mut in_flight) {
                            writer.close().await;
                            break Ok(end);
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if let Some(end) = self.on_frame(text.as_bytes(), &writer, &mut in_flight) {
                            writer.close().await;
                            break Ok(end);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.as_str().to_owned()).unwrap_or_default();
                        break Err(TransportError::Lost(format!("websocket closed. reason: {reason}")));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(TransportError::Lost(e.to_string())),
                    None => break Err(TransportError::Lost("stream ended".to_owned())),
                },
                Some(joined) = in_flight.join_next() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Request task panicked");
                        }
                    }
                }
                () = stopped(stop) => {
                    writer.close().await;
                    break Ok(SessionEnd::Stopped);
                }
            }
        };

        if !in_flight.is_empty() {
            debug!(count = in_flight.len(), "Aborting in-flight requests");
        }
        in_flight.abort_all();
        end
    }

    /// Decode one inbound message and start its request.
    ///
    /// Returns the terminal state when the peer asked to close. Malformed
    /// frames are dropped; the connection stays up.
    fn on_frame(
        &self,
        bytes: &[u8],
        writer: &FrameWriter,
        in_flight: &mut JoinSet<()>,
    ) -> Option<SessionEnd> {
        let frame = match super::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, len = bytes.len(), "Dropping malformed frame");
                return None;
            }
        };

        let RequestEnvelope { event_id, request } = RequestEnvelope::from_control(frame.control);
        if let Request::CloseWs { reason } = request {
            info!(?reason, "Peer closed the session");
            return Some(SessionEnd::PeerClosed { reason });
        }

        debug!(event_id = %event_id, "Dispatching request");
        let dispatcher = self.dispatcher.clone();
        let writer = writer.clone();
        in_flight.spawn(async move {
            let Some(reply) = dispatcher.dispatch(event_id, request, frame.payload).await else {
                return;
            };
            let bytes = match reply.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(error = %e, "Failed to encode reply");
                    return;
                }
            };
            if let Err(e) = writer.send(Message::binary(bytes)).await {
                debug!(error = %e, event_id = %reply.response.event_id(), "Reply not delivered");
            }
        });
        None
    }
}

/// Resolves once a stop is requested or the handle is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

/// Handle to a running agent.
pub struct AgentHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<SessionEnd>,
}

impl AgentHandle {
    /// Ask the agent to close its socket and stop reconnecting.
    pub fn stop(&self) {
        // Fails only when the agent already finished.
        let _ = self.stop.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the agent to finish.
    pub async fn wait(self) -> anyhow::Result<SessionEnd> {
        let Self { stop, task } = self;
        let end = task.await?;
        drop(stop);
        Ok(end)
    }
}
