//! Agent configuration.
//!
//! Layered the same way at every entry point: a JSON document (from the
//! `BROWSERFETCH_CONFIG` env var or a file), then individual env vars, then
//! whatever the caller overrides (CLI flags in the binary).

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::{Host, Url};

/// Env var holding a full JSON configuration document.
pub const CONFIG_ENV: &str = "BROWSERFETCH_CONFIG";

/// Protocol revision announced in the handshake.
pub const PROTOCOL_VERSION: &str = "3";

/// Configuration problems detected by [`AgentConfig::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("host_id must not be empty")]
    EmptyHostId,

    #[error("host_id must not contain whitespace: {0:?}")]
    HostIdWhitespace(String),

    #[error("invalid endpoint {0}: {1}")]
    InvalidEndpoint(String, String),

    #[error("endpoint {0} is not a loopback address; set allow_remote_peer to connect anyway")]
    RemotePeer(String),

    #[error("reconnect_delay_seconds must be a positive number, got {0}")]
    InvalidDelay(String),

    #[error("evaluator command must not be empty")]
    EmptyEvaluatorCommand,
}

/// Top-level configuration for the agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// WebSocket endpoint of the control server.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Identifier announced in the handshake (a page's `location.host`).
    #[serde(default)]
    pub host_id: String,

    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    /// Fixed delay between a lost connection and the next attempt.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_seconds: f64,

    /// Permit a non-loopback endpoint. The peer can run arbitrary code here.
    #[serde(default)]
    pub allow_remote_peer: bool,

    #[serde(default)]
    pub user_agent: Option<String>,

    /// Cookies placed in the shared jar before the first request.
    #[serde(default)]
    pub cookies: Vec<CookieSeed>,

    #[serde(default)]
    pub evaluator: EvaluatorConfig,
}

/// A `Set-Cookie` style string and the URL it was set from.
#[derive(Debug, Clone, Deserialize)]
pub struct CookieSeed {
    pub url: String,
    pub cookie: String,
}

/// Interpreter used by the process evaluator.
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluatorConfig {
    /// Program and arguments; the script is written to its stdin.
    #[serde(default = "default_evaluator_command")]
    pub command: Vec<String>,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            command: default_evaluator_command(),
        }
    }
}

fn default_endpoint() -> String {
    "ws://127.0.0.1:9404/ws".into()
}

fn default_protocol_version() -> String {
    PROTOCOL_VERSION.into()
}

const fn default_reconnect_delay() -> f64 {
    5.0
}

fn default_evaluator_command() -> Vec<String> {
    crate::host::ProcessEvaluator::NODE_COMMAND
        .iter()
        .map(|s| (*s).to_owned())
        .collect()
}

impl AgentConfig {
    /// Defaults with the given host identifier.
    pub fn for_host(host_id: impl Into<String>) -> Self {
        Self {
            endpoint: default_endpoint(),
            host_id: host_id.into(),
            protocol_version: default_protocol_version(),
            reconnect_delay_seconds: default_reconnect_delay(),
            allow_remote_peer: false,
            user_agent: None,
            cookies: Vec::new(),
            evaluator: EvaluatorConfig::default(),
        }
    }

    /// Parse a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse configuration JSON")
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Load from `BROWSERFETCH_CONFIG` (if set), then apply env overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(json) => Self::from_json(&json).with_context(|| format!("Failed to parse {CONFIG_ENV}"))?,
            Err(_) => Self::for_host(String::new()),
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply `BROWSERFETCH_ENDPOINT`, `BROWSERFETCH_HOST_ID` and
    /// `BROWSERFETCH_RECONNECT_DELAY` when present.
    pub fn apply_env(&mut self) {
        if let Ok(endpoint) = std::env::var("BROWSERFETCH_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Ok(host_id) = std::env::var("BROWSERFETCH_HOST_ID") {
            self.host_id = host_id;
        }
        if let Some(delay) = std::env::var("BROWSERFETCH_RECONNECT_DELAY")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.reconnect_delay_seconds = delay;
        }
    }

    /// Check the invariants the connection manager relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host_id.is_empty() {
            return Err(ConfigError::EmptyHostId);
        }
        if self.host_id.chars().any(char::is_whitespace) {
            return Err(ConfigError::HostIdWhitespace(self.host_id.clone()));
        }
        let delay = Duration::try_from_secs_f64(self.reconnect_delay_seconds);
        if !matches!(delay, Ok(d) if !d.is_zero()) {
            return Err(ConfigError::InvalidDelay(self.reconnect_delay_seconds.to_string()));
        }
        if self.evaluator.command.is_empty() {
            return Err(ConfigError::EmptyEvaluatorCommand);
        }

        let url = Url::parse(&self.endpoint)
            .map_err(|e| ConfigError::InvalidEndpoint(self.endpoint.clone(), e.to_string()))?;
        if url.scheme() != "ws" {
            return Err(ConfigError::InvalidEndpoint(
                self.endpoint.clone(),
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }
        if !self.allow_remote_peer && !is_loopback(&url) {
            return Err(ConfigError::RemotePeer(self.endpoint.clone()));
        }

        debug!(endpoint = %self.endpoint, host_id = %self.host_id, "Configuration validated");
        Ok(())
    }

    /// Delay before reconnecting after a lost connection.
    ///
    /// Falls back to the default when the configured value is out of range;
    /// `validate` rejects such values up front.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.reconnect_delay_seconds)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_reconnect_delay()))
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}
