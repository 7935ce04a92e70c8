//! # Engine Configuration
//!
//! `EngineConfig` is read from camelCase JSON; missing fields take the defaults of
//! the hosted front end (`https://localhost:7236`, hub `/hubs/comments`, the
//! SignalR reconnect schedule and timeouts).

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::connection::ReconnectPolicy;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Base URL of the REST API, also hosting the hub.
    pub api_base_url: String,
    /// Path of the hub below `api_base_url`.
    pub hub_path: String,
    /// Bearer token sent on REST calls and the hub handshake.
    pub access_token: Option<String>,
    /// Whether the session belongs to a signed-in user.
    pub authenticated: bool,
    /// Delay before each automatic reconnect attempt. Empty disables reconnects.
    pub reconnect_delays_ms: Vec<u64>,
    pub handshake_timeout_ms: u64,
    pub invocation_timeout_ms: u64,
    pub keep_alive_interval_ms: u64,
    /// Retries of transient REST failures.
    pub rest_max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://localhost:7236".to_string(),
            hub_path: "/hubs/comments".to_string(),
            access_token: None,
            authenticated: false,
            reconnect_delays_ms: vec![0, 2_000, 10_000, 30_000],
            handshake_timeout_ms: 15_000,
            invocation_timeout_ms: 30_000,
            keep_alive_interval_ms: 15_000,
            rest_max_retries: 3,
        }
    }
}

impl EngineConfig {
    /// Reads and validates a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.api_base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "apiBaseUrl must be an http(s) URL, got '{}'",
                self.api_base_url
            )));
        }
        if !self.hub_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "hubPath must start with '/', got '{}'",
                self.hub_path
            )));
        }
        if self.handshake_timeout_ms == 0 || self.invocation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "handshake and invocation timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// `api_base_url` without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.api_base_url.trim().trim_end_matches('/')
    }

    /// Full HTTP URL of the hub.
    pub fn hub_url(&self) -> String {
        format!("{}{}", self.base_url(), self.hub_path)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from_millis(&self.reconnect_delays_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }

    /// `None` disables keep-alive pings.
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        (self.keep_alive_interval_ms > 0).then(|| Duration::from_millis(self.keep_alive_interval_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_fields_take_defaults() {
        let config = EngineConfig::from_json_str(r#"{"accessToken":"abc","authenticated":true}"#).unwrap();
        assert_eq!(config.access_token.as_deref(), Some("abc"));
        assert!(config.authenticated);
        assert_eq!(config.hub_url(), "https://localhost:7236/hubs/comments");
        assert_eq!(
            config.reconnect_policy(),
            ReconnectPolicy::from_millis(&[0, 2_000, 10_000, 30_000])
        );
        assert_eq!(config.invocation_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn loads_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"apiBaseUrl":"http://api.test/","reconnectDelaysMs":[],"keepAliveIntervalMs":0}}"#
        )
        .unwrap();

        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.hub_url(), "http://api.test/hubs/comments");
        assert!(config.reconnect_policy().delays().is_empty());
        assert_eq!(config.keep_alive_interval(), None);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(matches!(
            EngineConfig::from_json_str(r#"{"apiBaseUrl":"ftp://x"}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_json_str(r#"{"hubPath":"hubs"}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_json_str("{not json"),
            Err(ConfigError::JsonError(_))
        ));
        assert!(matches!(
            EngineConfig::from_json_file("/definitely/not/here.json"),
            Err(ConfigError::IoError(_))
        ));
    }
}
