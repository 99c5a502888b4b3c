//! Client configuration loaded from environment variables.

use parley_shared::constants::DEFAULT_HTTP_PORT;
use parley_shared::types::UserId;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Env: `PARLEY_SERVER_URL`
    /// Default: `http://localhost:5000`
    pub server_url: String,

    /// Registered user to act as.
    /// Env: `PARLEY_USER_ID`
    pub user_id: Option<UserId>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: format!("http://localhost:{DEFAULT_HTTP_PORT}"),
            user_id: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("PARLEY_SERVER_URL") {
            if !url.is_empty() {
                config.server_url = url;
            }
        }

        if let Some(raw) = lookup("PARLEY_USER_ID") {
            match UserId::parse(raw.trim()) {
                Ok(id) => config.user_id = Some(id),
                Err(e) => tracing::warn!(value = %raw, error = %e, "Invalid PARLEY_USER_ID, ignoring"),
            }
        }

        config
    }
}
