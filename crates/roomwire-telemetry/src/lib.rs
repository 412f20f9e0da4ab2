//! Logging setup shared by the roomwire binary and embedders.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "roomwire_server" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

impl TelemetryConfig {
    /// Parse a level name such as `"debug"` or `"WARN"`.
    pub fn parse_level(s: &str) -> Result<Level, TelemetryError> {
        Level::from_str(s).map_err(|_| TelemetryError::InvalidLevel(s.to_string()))
    }

    /// Build the filter directive string, e.g. `info,roomwire_server=debug`.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Handle returned by [`init_telemetry`]; records the filter that took effect.
#[derive(Debug)]
pub struct TelemetryGuard {
    filter: String,
    json: bool,
}

impl TelemetryGuard {
    /// Active filter directives; `RUST_LOG` when set, else the configured levels.
    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn is_json(&self) -> bool {
        self.json
    }
}

/// Initialize the global tracing subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let (env_filter, filter) = match EnvFilter::try_from_default_env() {
        Ok(from_env) => {
            let directives = from_env.to_string();
            (from_env, directives)
        }
        Err(_) => {
            let directives = config.filter_directives();
            (EnvFilter::new(&directives), directives)
        }
    };

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInstalled(e.to_string()))?;

    Ok(TelemetryGuard {
        filter,
        json: config.json,
    })
}
