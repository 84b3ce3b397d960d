//! Error types for the file monitor.

use std::path::PathBuf;
use thiserror::Error;

use super::listener::ListenerId;
use super::source::WatchHandle;

/// Errors from monitor operations.
///
/// Only [`MonitorError::SourceUnavailable`] and [`MonitorError::NoWatchTargets`]
/// are fatal; the loop logs and skips the rest.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Cannot watch directory {path}: {reason}")]
    Registration { path: PathBuf, reason: String },

    #[error("Unknown watch handle {0}")]
    UnknownHandle(WatchHandle),

    #[error("No watch targets: every configured root failed to register")]
    NoWatchTargets,

    #[error("Event source unavailable: {reason}")]
    SourceUnavailable { reason: String },

    #[error("Listener {listener} failed: {reason}")]
    ListenerFailure { listener: ListenerId, reason: String },

    #[error("Monitor is not running")]
    NotRunning,

    #[error("Monitor already started")]
    AlreadyStarted,

    #[error("Monitor is stopped")]
    Stopped,
}

impl MonitorError {
    /// Build a registration error for `path` from any displayable cause.
    pub fn registration(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        MonitorError::Registration {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// True for errors that must end startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MonitorError::NoWatchTargets | MonitorError::SourceUnavailable { .. }
        )
    }
}

impl From<notify::Error> for MonitorError {
    fn from(e: notify::Error) -> Self {
        MonitorError::SourceUnavailable {
            reason: e.to_string(),
        }
    }
}

pub type MonitorResult<T> = Result<T, MonitorError>;
