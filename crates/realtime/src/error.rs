use std::path::PathBuf;

use thiserror::Error;

/// Failure to open or use a transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid connection target: {0}")]
    InvalidTarget(String),

    #[error("Failed to open connection: {0}")]
    Open(String),

    #[error("Failed to send frame: {0}")]
    Send(String),

    #[error("Connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Failure to load connection settings
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid WebSocket URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}
