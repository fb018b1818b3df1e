use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};
use url::Url;

use crate::error::ConfigError;
use crate::policy::ReconnectPolicy;

pub const DEFAULT_WS_URL: &str = "ws://localhost:3001";

/// Environment variable overriding [`ConnectionConfig::ws_url`]
pub const WS_URL_ENV: &str = "INTERVIEW_WS_URL";

/// Connection settings, stored as TOML:
///
/// ```toml
/// ws_url = "ws://localhost:3001"
///
/// [reconnect]
/// base_delay_ms = 1000
/// max_attempts = 5
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Base URL of the session relay; `/ws` is appended per connection
    pub ws_url: String,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    /// Load config from `path`. A missing file yields the defaults; a path
    /// that cannot be checked or read is an error.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let exists = fs::try_exists(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if !exists {
            debug!(path = %path.display(), "Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(path = %path.display(), "Config loaded successfully");
        Ok(config)
    }

    /// Like [`ConnectionConfig::load`], but logs and falls back to defaults
    /// on any error
    pub async fn read_or_default(path: &Path) -> Self {
        match Self::load(path).await {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Write config to `path`, creating parent directories
    pub async fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        fs::write(path, content).await?;
        debug!(path = %path.display(), "Config saved successfully");

        Ok(())
    }

    /// Apply `INTERVIEW_WS_URL` if it is set
    pub fn apply_env_overrides(self) -> Self {
        self.override_ws_url(std::env::var(WS_URL_ENV).ok())
    }

    fn override_ws_url(mut self, value: Option<String>) -> Self {
        if let Some(url) = value.filter(|url| !url.trim().is_empty()) {
            debug!(ws_url = %url, "WebSocket URL overridden from environment");
            self.ws_url = url;
        }
        self
    }

    /// Parsed and validated relay base URL
    pub fn ws_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.ws_url).map_err(|e| ConfigError::InvalidUrl {
            url: self.ws_url.clone(),
            reason: e.to_string(),
        })?;

        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(ConfigError::InvalidUrl {
                url: self.ws_url.clone(),
                reason: format!("unsupported scheme '{}', expected ws or wss", other),
            }),
        }
    }
}
