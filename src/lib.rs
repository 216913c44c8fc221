//! tumblr-update: an incremental, resumable media mirror for tumblr blogs
//!
//! This crate crawls a set of blogs through the paginated read API, discovers
//! downloadable media, collapses identical files found through different blogs
//! into hard links, and downloads everything else under a shared request budget.

pub mod config;
pub mod crawler;
pub mod download;
pub mod output;
pub mod state;
pub mod storage;

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for tumblr-update operations
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("Filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Run cancelled")]
    Cancelled,
}

impl UpdateError {
    /// Wraps an IO error with the path it happened on
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid source '{name}': {reason}")]
    InvalidSource { name: String, reason: String },
}

/// Result type alias for tumblr-update operations
pub type Result<T> = std::result::Result<T, UpdateError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{Coordinator, Shutdown};
pub use output::{GlobalStats, StatsSnapshot};
pub use state::{PostId, SourceStatus};
