//! Error types for the ChatPulse monitor.
//!
//! Per-file failures (unreadable files, malformed lines) are absorbed by the
//! ingestion pipeline and logged. [`MonitorError`] covers what is surfaced to
//! the caller: invalid configuration and failing to establish the root watch.

use thiserror::Error;

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::watcher::WatcherError;

/// Errors that can occur during monitor operations.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The root directory could not be watched.
    #[error("file watch error: {0}")]
    Watch(#[from] WatcherError),

    /// A conversation file could not be read.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// A background task panicked or was cancelled.
    #[error("task error: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for MonitorError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

/// Result type alias for monitor operations.
pub type Result<T> = std::result::Result<T, MonitorError>;
