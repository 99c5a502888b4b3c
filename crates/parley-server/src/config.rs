//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use parley_shared::constants::{
    DEFAULT_HTTP_PORT, EVENT_BUFFER, LIVENESS_TIMEOUT_SECS, MAX_MEDIA_SIZE, SWEEP_INTERVAL_SECS,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API and live endpoint.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:5000`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./parley.db`
    pub database_path: PathBuf,

    /// Directory where uploaded media is written.
    /// Env: `MEDIA_STORAGE_PATH`
    /// Default: `./media`
    pub media_storage_path: PathBuf,

    /// Base URL used when building media links handed to clients.
    /// Env: `PUBLIC_BASE_URL`
    /// Default: `http://localhost:5000`
    pub public_base_url: String,

    /// Maximum decoded media size in bytes.
    /// Env: `MAX_MEDIA_SIZE`
    pub max_media_size: usize,

    /// A live connection silent for longer than this is evicted.
    /// Env: `LIVENESS_TIMEOUT_SECS`
    pub liveness_timeout: Duration,

    /// How often the liveness sweep runs.
    /// Env: `SWEEP_INTERVAL_SECS`
    pub sweep_interval: Duration,

    /// Per-connection outbound queue depth.
    /// Env: `EVENT_BUFFER`
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./parley.db"),
            media_storage_path: PathBuf::from("./media"),
            public_base_url: format!("http://localhost:{DEFAULT_HTTP_PORT}"),
            max_media_size: MAX_MEDIA_SIZE,
            liveness_timeout: Duration::from_secs(LIVENESS_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(SWEEP_INTERVAL_SECS),
            event_buffer: EVENT_BUFFER,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reading from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(path) = lookup("MEDIA_STORAGE_PATH") {
            config.media_storage_path = PathBuf::from(path);
        }

        if let Some(url) = lookup("PUBLIC_BASE_URL") {
            if !url.is_empty() {
                config.public_base_url = url;
            }
        }

        if let Some(n) = parse_positive(&lookup, "MAX_MEDIA_SIZE") {
            config.max_media_size = n as usize;
        }

        if let Some(secs) = parse_positive(&lookup, "LIVENESS_TIMEOUT_SECS") {
            config.liveness_timeout = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_positive(&lookup, "SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs);
        }

        if let Some(n) = parse_positive(&lookup, "EVENT_BUFFER") {
            config.event_buffer = n as usize;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Parse a strictly positive integer setting, warning on anything else.
fn parse_positive<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(key)?;
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(key, value = %value, "Invalid setting, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 5000).into());
        assert_eq!(config.liveness_timeout, Duration::from_secs(60));
        assert_eq!(config.public_base_url, "http://localhost:5000");
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("DATABASE_PATH", "/tmp/chat.db"),
            ("LIVENESS_TIMEOUT_SECS", "5"),
            ("EVENT_BUFFER", "8"),
        ]));
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.database_path, PathBuf::from("/tmp/chat.db"));
        assert_eq!(config.liveness_timeout, Duration::from_secs(5));
        assert_eq!(config.event_buffer, 8);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "not-an-addr"),
            ("SWEEP_INTERVAL_SECS", "0"),
            ("MAX_MEDIA_SIZE", "lots"),
        ]));
        let default = ServerConfig::default();
        assert_eq!(config.http_addr, default.http_addr);
        assert_eq!(config.sweep_interval, default.sweep_interval);
        assert_eq!(config.max_media_size, default.max_media_size);
    }
}
