use crate::client::realtime::SessionConfig;
use crate::shared::config::{AppConfig, AppConfigBuilder, ConfigError};
use crate::shared::UserId;
use std::path::Path;
use std::time::Duration;

pub const ENV_API_URL: &str = "LIVESYNC_API_URL";
pub const ENV_BROKER_URL: &str = "LIVESYNC_BROKER_URL";
pub const ENV_USER_ID: &str = "LIVESYNC_USER_ID";
pub const ENV_TOKEN: &str = "LIVESYNC_TOKEN";

/// Runtime client configuration: the validated file/builder config plus
/// environment overrides. The bearer token lives in `app.auth_token`.
#[derive(Debug, Clone)]
pub struct Config {
    app: AppConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::new(AppConfig::default())
    }
}

impl Config {
    pub fn new(app: AppConfig) -> Self {
        Self { app }
    }

    pub fn with_builder(builder: AppConfigBuilder) -> Result<Self, ConfigError> {
        Self::with_env_overrides(builder.build()?)
    }

    /// Defaults, then environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::with_env_overrides(AppConfig::default())
    }

    /// Load `path`, or the default config file when it exists, then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let app = match path {
            Some(path) => AppConfig::load(path)?,
            None => match AppConfig::default_path().filter(|path| path.exists()) {
                Some(path) => {
                    tracing::debug!(path = %path.display(), "Loading config file");
                    AppConfig::load(path)?
                }
                None => AppConfig::default(),
            },
        };
        Self::with_env_overrides(app)
    }

    pub fn with_env_overrides(mut app: AppConfig) -> Result<Self, ConfigError> {
        if let Ok(url) = std::env::var(ENV_API_URL) {
            app.api_url = url;
        }
        if let Ok(url) = std::env::var(ENV_BROKER_URL) {
            app.broker_url = url;
        }
        if let Ok(raw) = std::env::var(ENV_USER_ID) {
            let user_id = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                field: "user_id",
                message: format!("{ENV_USER_ID}={raw} is not a user id"),
            })?;
            app.user_id = Some(user_id);
        }
        if let Ok(token) = std::env::var(ENV_TOKEN) {
            app.auth_token = Some(token).filter(|token| !token.is_empty());
        }
        app.validate()?;
        Ok(Self::new(app))
    }

    pub fn app(&self) -> &AppConfig {
        &self.app
    }

    /// Set the bearer token
    pub fn set_token(&mut self, token: Option<String>) {
        self.app.auth_token = token.filter(|token| !token.is_empty());
    }

    pub fn get_token(&self) -> Option<&str> {
        self.app.auth_token.as_deref()
    }

    pub fn clear_token(&mut self) {
        self.app.auth_token = None;
    }

    /// Full URL for an API path such as `/notifications`
    pub fn api_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.app.api_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn broker_url(&self) -> &str {
        &self.app.broker_url
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.app.user_id
    }

    pub fn page_size(&self) -> u32 {
        self.app.page_size
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.app.request_timeout_ms)
    }

    pub fn resync_on_reconnect(&self) -> bool {
        self.app.resync_on_reconnect
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::from(&self.app)
    }
}
