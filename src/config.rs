//! Configuration surface consumed by the transport.
//!
//! A single websocket url plus the connector options, loadable from an
//! optional JSON file with per-field defaults. `LIVESTYLE_URL` overrides
//! the url from the environment.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default relay endpoint, shared by editors and patchers on one machine.
pub const DEFAULT_URL: &str = "ws://127.0.0.1:54000/livestyle";

pub const URL_ENV_VAR: &str = "LIVESTYLE_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    pub websocket_url: String,
    pub reconnect_on_close: bool,
    pub max_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            websocket_url: DEFAULT_URL.to_string(),
            reconnect_on_close: true,
            max_retries: 5,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a JSON file, falling back to defaults when
    /// the file is missing or unreadable, then apply the environment
    /// override.
    pub async fn load(path: Option<&Path>) -> Self {
        let mut config = match path {
            Some(path) => match tokio::fs::read(path).await {
                Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                    warn!(path = %path.display(), error = %e, "invalid config file, using defaults");
                    Self::default()
                }),
                Err(_) => Self::default(),
            },
            None => Self::default(),
        };

        if let Ok(url) = std::env::var(URL_ENV_VAR) {
            if !url.is_empty() {
                config.websocket_url = url;
            }
        }
        config
    }

    /// Connector options carried by this config.
    pub fn connect_options(&self) -> crate::sync::ConnectOptions {
        crate::sync::ConnectOptions {
            reconnect_on_close: self.reconnect_on_close,
            max_retries: self.max_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn defaults_when_no_file() {
        let config = SyncConfig::load(None).await;
        assert_eq!(config.websocket_url, DEFAULT_URL);
        assert!(config.reconnect_on_close);
        assert_eq!(config.max_retries, 5);
    }

    #[tokio::test]
    async fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"websocketUrl": "ws://127.0.0.1:9000/livestyle"}}"#).unwrap();

        let config = SyncConfig::load(Some(file.path())).await;
        assert_eq!(config.websocket_url, "ws://127.0.0.1:9000/livestyle");
        assert_eq!(config.max_retries, 5);
    }

    #[tokio::test]
    async fn invalid_file_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let config = SyncConfig::load(Some(file.path())).await;
        assert_eq!(config.websocket_url, DEFAULT_URL);
    }
}
