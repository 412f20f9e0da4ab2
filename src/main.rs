//! # roomwire
//!
//! Room broker binary: reads configuration from the environment, applies
//! command-line overrides and serves until Ctrl-C.

#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use roomwire_server::ServerConfig;
use roomwire_telemetry::{init_telemetry, TelemetryConfig};

/// Room-scoped pub/sub and RPC broker over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "roomwire", about = "Room-scoped pub/sub and RPC broker")]
struct Cli {
    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// WebSocket endpoint path.
    #[arg(long)]
    path: Option<String>,

    /// Accept positional `[event, data]` frames.
    #[arg(long)]
    compat: bool,

    /// Largest inbound frame in bytes.
    #[arg(long)]
    max_message_size: Option<usize>,

    /// Default log level; `RUST_LOG` takes precedence.
    #[arg(long, env = "ROOMWIRE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::from_env();
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(path) = &self.path {
            config.socket_path.clone_from(path);
        }
        if self.compat {
            config.compat = true;
        }
        if let Some(size) = self.max_message_size {
            config.max_message_size = size.max(1);
        }
        config
    }

    fn telemetry_config(&self) -> Result<TelemetryConfig> {
        Ok(TelemetryConfig {
            log_level: TelemetryConfig::parse_level(&self.log_level)?,
            json: self.json_logs,
            ..TelemetryConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let telemetry = init_telemetry(args.telemetry_config()?)?;
    tracing::debug!(filter = telemetry.filter(), json = telemetry.is_json(), "logging initialized");
    let config = args.server_config();

    let handle = roomwire_server::start(config)
        .await
        .context("Failed to start server")?;
    tracing::info!(url = %handle.socket_url(), "listening");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    handle.shutdown().await;
    Ok(())
}
