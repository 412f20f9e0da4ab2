//! Server configuration with environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerConfig::default()`]
//! 2. Apply environment variable overrides (first listed variable wins)
//!
//! Invalid values are ignored and the default is kept.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Configuration for the roomwire server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (default `4000`, `0` auto-assigns).
    pub port: u16,
    /// HTTP path serving the WebSocket upgrade.
    pub socket_path: String,
    /// Accept the legacy positional frame encoding.
    pub compat: bool,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue capacity.
    pub max_send_queue: usize,
    /// Seconds a relayed call may wait for its result; `0` waits forever.
    pub call_timeout_secs: u64,
    /// Drop rooms from the registry once their last member leaves.
    pub reclaim_empty_rooms: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 4000,
            socket_path: "/socket.io".into(),
            compat: false,
            max_message_size: 1_000_000,
            max_send_queue: 256,
            call_timeout_secs: 0,
            reclaim_empty_rooms: true,
        }
    }
}

impl ServerConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = read_env_string(&["ROOMWIRE_HOST", "HOST"]) {
            self.host = v;
        }
        if let Some(v) = read_env_u16(&["WIREIO_PORT", "PORT"]) {
            self.port = v;
        }
        if let Some(v) = read_env_string(&["WIREIO_SOCKET_PATH", "SOCKET_PATH"]) {
            self.socket_path = v;
        }
        if let Some(v) = read_env_compat("SOCKET_COMPAT") {
            self.compat = v;
        }
        if let Some(v) = read_env_usize(&["WIREIO_MAX_HTTP_BUFFER_SIZE"], 1) {
            self.max_message_size = v;
        }
        if let Some(v) = read_env_usize(&["ROOMWIRE_MAX_SEND_QUEUE"], 1) {
            self.max_send_queue = v;
        }
        if let Some(v) = read_env_u64(&["ROOMWIRE_CALL_TIMEOUT_SECS"]) {
            self.call_timeout_secs = v;
        }
        if let Some(v) = read_env_bool("ROOMWIRE_RECLAIM_EMPTY_ROOMS") {
            self.reclaim_empty_rooms = v;
        }
    }

    /// The socket path, always starting with `/`.
    pub fn normalized_socket_path(&self) -> String {
        let trimmed = self.socket_path.trim();
        if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        }
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_secs > 0).then(|| Duration::from_secs(self.call_timeout_secs))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn read_env_first(keys: &[&str]) -> Option<(String, String)> {
    keys.iter().find_map(|key| {
        std::env::var(key)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(|v| ((*key).to_string(), v))
    })
}

fn read_env_string(keys: &[&str]) -> Option<String> {
    read_env_first(keys).map(|(_, v)| v)
}

fn read_env_u16(keys: &[&str]) -> Option<u16> {
    let (key, raw) = read_env_first(keys)?;
    match raw.parse::<u16>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = raw, "ignoring invalid port");
            None
        }
    }
}

fn read_env_u64(keys: &[&str]) -> Option<u64> {
    let (key, raw) = read_env_first(keys)?;
    match raw.parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = raw, "ignoring invalid integer");
            None
        }
    }
}

/// Accepts plain integers and float notation such as `1e6`.
fn read_env_usize(keys: &[&str], min: usize) -> Option<usize> {
    let (key, raw) = read_env_first(keys)?;
    let parsed = raw.parse::<usize>().ok().or_else(|| {
        raw.parse::<f64>()
            .ok()
            .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0)
            .map(|f| f as usize)
    });
    match parsed {
        Some(v) if v >= min => Some(v),
        _ => {
            warn!(key, value = raw, "ignoring invalid size");
            None
        }
    }
}

fn read_env_bool(key: &str) -> Option<bool> {
    let (_, raw) = read_env_first(&[key])?;
    parse_bool(&raw)
}

/// `SOCKET_COMPAT` is only on when explicitly set to `1` or `true`.
fn read_env_compat(key: &str) -> Option<bool> {
    read_env_first(&[key]).map(|(_, raw)| matches!(raw.as_str(), "1" | "true"))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; each uses variable names no other test touches.

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 4000);
        assert_eq!(cfg.socket_path, "/socket.io");
        assert!(!cfg.compat);
        assert_eq!(cfg.max_message_size, 1_000_000);
        assert_eq!(cfg.call_timeout(), None);
        assert!(cfg.reclaim_empty_rooms);
    }

    #[test]
    fn socket_path_gets_leading_slash() {
        let cfg = ServerConfig {
            socket_path: "ws".into(),
            ..ServerConfig::default()
        };
        assert_eq!(cfg.normalized_socket_path(), "/ws");
        assert_eq!(ServerConfig::default().normalized_socket_path(), "/socket.io");
    }

    #[test]
    fn call_timeout_zero_means_none() {
        let cfg = ServerConfig {
            call_timeout_secs: 5,
            ..ServerConfig::default()
        };
        assert_eq!(cfg.call_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn bind_addr_format() {
        let cfg = ServerConfig {
            host: "127.0.0.1".into(),
            port: 9000,
            ..ServerConfig::default()
        };
        assert_eq!(cfg.bind_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn first_env_key_wins() {
        std::env::set_var("RW_TEST_FIRST_A", "one");
        std::env::set_var("RW_TEST_FIRST_B", "two");
        assert_eq!(
            read_env_string(&["RW_TEST_FIRST_A", "RW_TEST_FIRST_B"]).as_deref(),
            Some("one")
        );
        std::env::remove_var("RW_TEST_FIRST_A");
        assert_eq!(
            read_env_string(&["RW_TEST_FIRST_A", "RW_TEST_FIRST_B"]).as_deref(),
            Some("two")
        );
        std::env::remove_var("RW_TEST_FIRST_B");
    }

    #[test]
    fn invalid_port_ignored() {
        std::env::set_var("RW_TEST_PORT_BAD", "70000");
        assert_eq!(read_env_u16(&["RW_TEST_PORT_BAD"]), None);
        std::env::set_var("RW_TEST_PORT_BAD", "8080");
        assert_eq!(read_env_u16(&["RW_TEST_PORT_BAD"]), Some(8080));
        std::env::remove_var("RW_TEST_PORT_BAD");
    }

    #[test]
    fn size_accepts_float_notation() {
        std::env::set_var("RW_TEST_SIZE", "1e6");
        assert_eq!(read_env_usize(&["RW_TEST_SIZE"], 1), Some(1_000_000));
        std::env::set_var("RW_TEST_SIZE", "0");
        assert_eq!(read_env_usize(&["RW_TEST_SIZE"], 1), None);
        std::env::set_var("RW_TEST_SIZE", "big");
        assert_eq!(read_env_usize(&["RW_TEST_SIZE"], 1), None);
        std::env::remove_var("RW_TEST_SIZE");
    }

    #[test]
    fn compat_only_for_one_or_true() {
        std::env::set_var("RW_TEST_COMPAT", "1");
        assert_eq!(read_env_compat("RW_TEST_COMPAT"), Some(true));
        std::env::set_var("RW_TEST_COMPAT", "true");
        assert_eq!(read_env_compat("RW_TEST_COMPAT"), Some(true));
        std::env::set_var("RW_TEST_COMPAT", "yes");
        assert_eq!(read_env_compat("RW_TEST_COMPAT"), Some(false));
        std::env::remove_var("RW_TEST_COMPAT");
        assert_eq!(read_env_compat("RW_TEST_COMPAT"), None);
    }

    #[test]
    fn bool_parsing() {
        assert_eq!(parse_bool("on"), Some(true));
        assert_eq!(parse_bool("OFF"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = ServerConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port, cfg.port);
        assert_eq!(back.socket_path, cfg.socket_path);
        assert_eq!(back.reclaim_empty_rooms, cfg.reclaim_empty_rooms);
    }
}
