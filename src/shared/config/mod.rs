//! Application configuration module
//!
//! Provides the engine configuration, its builder and TOML loading.
//!
//! ```toml
//! api_url = "https://example.org/api"
//! broker_url = "wss://example.org/ws"
//! user_id = 42
//! page_size = 20
//!
//! [reconnect]
//! strategy = "exponential"
//! base_delay_ms = 1000
//! max_delay_ms = 30000
//! jitter = 0.2
//! max_attempts = 50
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default REST base URL
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080/api";
/// Default broker endpoint
pub const DEFAULT_BROKER_URL: &str = "ws://127.0.0.1:8080/ws";
/// Default history page size
pub const DEFAULT_PAGE_SIZE: u32 = 20;
/// Observed fixed reconnect delay
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// REST base URL
    pub api_url: String,
    /// Broker WebSocket URL
    pub broker_url: String,
    /// Signed-in user, required for the notification queue
    pub user_id: Option<u64>,
    /// Bearer token for REST and broker
    pub auth_token: Option<String>,
    /// Items per history page
    pub page_size: u32,
    /// Timeout applied to every REST request
    pub request_timeout_ms: u64,
    /// Timeout applied to each transport handshake
    pub connect_timeout_ms: u64,
    /// Tear the session down once the last subscription is removed
    pub disconnect_when_idle: bool,
    /// Re-fetch the newest history page of every open topic after a reconnect
    pub resync_on_reconnect: bool,
    /// Reconnect policy
    pub reconnect: ReconnectConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            broker_url: DEFAULT_BROKER_URL.to_string(),
            user_id: None,
            auth_token: None,
            page_size: DEFAULT_PAGE_SIZE,
            request_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            disconnect_when_idle: true,
            resync_on_reconnect: true,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Backoff family used between reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Same delay after every failure
    Fixed,
    /// Doubling delay, capped at `max_delay_ms`
    Exponential,
}

/// Reconnect policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub strategy: BackoffKind,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay added as random jitter, in `[0, 1]`
    pub jitter: f64,
    /// Give up after this many consecutive failures; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffKind::Fixed,
            base_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            max_delay_ms: 60_000,
            jitter: 0.0,
            max_attempts: None,
        }
    }
}

impl AppConfig {
    /// Create a new AppConfigBuilder
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::default()
    }

    /// Parse a TOML document
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    /// `<config dir>/livesync/config.toml`, if the platform has a config dir
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("livesync").join("config.toml"))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !has_scheme(&self.api_url, &["http://", "https://"]) {
            return Err(ConfigError::InvalidUrl(self.api_url.clone()));
        }
        if !has_scheme(&self.broker_url, &["ws://", "wss://"]) {
            return Err(ConfigError::InvalidUrl(self.broker_url.clone()));
        }
        if self.page_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "page_size",
                message: "must be at least 1".to_string(),
            });
        }
        let reconnect = &self.reconnect;
        if !(0.0..=1.0).contains(&reconnect.jitter) {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.jitter",
                message: format!("{} is outside [0, 1]", reconnect.jitter),
            });
        }
        if reconnect.strategy == BackoffKind::Exponential && reconnect.max_delay_ms < reconnect.base_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.max_delay_ms",
                message: "must not be smaller than base_delay_ms".to_string(),
            });
        }
        Ok(())
    }
}

fn has_scheme(url: &str, schemes: &[&str]) -> bool {
    schemes
        .iter()
        .any(|scheme| url.len() > scheme.len() && url.starts_with(scheme))
}

/// Builder for AppConfig
#[derive(Debug, Default)]
pub struct AppConfigBuilder {
    config: AppConfig,
}

impl AppConfigBuilder {
    /// Set the REST base URL
    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_url = url.into();
        self
    }

    /// Set the broker URL
    pub fn broker_url(mut self, url: impl Into<String>) -> Self {
        self.config.broker_url = url.into();
        self
    }

    pub fn user_id(mut self, user_id: u64) -> Self {
        self.config.user_id = Some(user_id);
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.config.auth_token = Some(token.into());
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.config.page_size = page_size;
        self
    }

    pub fn request_timeout_ms(mut self, timeout: u64) -> Self {
        self.config.request_timeout_ms = timeout;
        self
    }

    pub fn connect_timeout_ms(mut self, timeout: u64) -> Self {
        self.config.connect_timeout_ms = timeout;
        self
    }

    pub fn disconnect_when_idle(mut self, enabled: bool) -> Self {
        self.config.disconnect_when_idle = enabled;
        self
    }

    pub fn resync_on_reconnect(mut self, enabled: bool) -> Self {
        self.config.resync_on_reconnect = enabled;
        self
    }

    /// Replace the reconnect policy
    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<AppConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("failed to read {}: {message}", path.display())]
    Io { path: PathBuf, message: String },
}
