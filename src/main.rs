//! browserfetch agent
//!
//! Connects to the control server and relays `fetch`/`eval` requests through
//! this host. Configuration comes from `BROWSERFETCH_CONFIG` (JSON), a
//! `--config` file, env vars and the flags below, in increasing priority.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use browserfetch_agent::config::AgentConfig;
use browserfetch_agent::{Agent, SessionEnd};

#[derive(Parser, Debug)]
#[command(name = "browserfetch-agent")]
#[command(about = "Relay fetch/eval requests from a local control server through this host")]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// WebSocket endpoint of the control server
    #[arg(long)]
    endpoint: Option<String>,

    /// Host identifier announced in the handshake
    #[arg(long)]
    host_id: Option<String>,

    /// Seconds to wait before reconnecting
    #[arg(long)]
    reconnect_delay: Option<f64>,

    /// Allow a non-loopback endpoint (the peer can run arbitrary code)
    #[arg(long)]
    allow_remote_peer: bool,

    /// Wait for a line on stdin before connecting
    #[arg(long)]
    defer: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn load_config(&self) -> Result<AgentConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let mut config = AgentConfig::from_file(path)?;
                config.apply_env();
                config
            }
            None => AgentConfig::from_env()?,
        };

        if let Some(endpoint) = &self.endpoint {
            config.endpoint.clone_from(endpoint);
        }
        if let Some(host_id) = &self.host_id {
            config.host_id.clone_from(host_id);
        }
        if let Some(delay) = self.reconnect_delay {
            config.reconnect_delay_seconds = delay;
        }
        if self.allow_remote_peer {
            config.allow_remote_peer = true;
        }
        Ok(config)
    }
}

/// Block until the user activates the agent by entering a line.
async fn wait_for_activation() -> Result<()> {
    info!("Waiting for activation: press Enter to connect");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("Failed to read activation from stdin")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout stays free)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = args.load_config().context("Failed to load configuration")?;
    let agent = Agent::from_config(config).context("Invalid configuration")?;

    info!(
        endpoint = %agent.config().endpoint,
        host_id = %agent.config().host_id,
        "Loaded configuration"
    );

    if args.defer {
        wait_for_activation().await?;
    }

    let handle = agent.start();
    let end = tokio::select! {
        end = handle.wait() => end?,
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Interrupted");
            return Ok(());
        }
    };

    match end {
        SessionEnd::PeerClosed { reason } => info!(?reason, "Server closed the session"),
        SessionEnd::Stopped => info!("Stopped"),
    }
    Ok(())
}
