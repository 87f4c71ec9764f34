//! Error types for the watcher

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for watcher operations
pub type Result<T> = std::result::Result<T, WatchError>;

/// Errors raised by the watcher and its backends
///
/// `BackendUnavailable` is fatal for the instance being constructed. Watch
/// and unwatch failures are reported to the caller with registry state left
/// unchanged. Read and close failures only ever surface inside the loop,
/// where they are logged and treated as an empty cycle.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The notification facility could not be opened
    #[error("notification backend unavailable: {0}")]
    BackendUnavailable(#[source] io::Error),

    /// The path already has a registered watch
    #[error("path is already watched: {}", .0.display())]
    AlreadyWatched(PathBuf),

    /// Another caller is currently adding or removing this path
    #[error("watch change already in flight for: {}", .0.display())]
    InFlight(PathBuf),

    /// The backend refused to watch a path
    #[error("failed to watch {}: {source}", path.display())]
    WatchFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The backend refused to drop a watch
    #[error("failed to unwatch {}: {source}", path.display())]
    UnwatchFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reading raw records failed
    #[error("failed to read change records: {0}")]
    ReadFailed(#[source] io::Error),

    /// The background thread could not be spawned
    #[error("failed to spawn watch loop thread: {0}")]
    SpawnFailed(#[source] io::Error),

    /// Closing the backend connection failed
    #[error("failed to close notification backend: {0}")]
    CloseFailed(#[source] io::Error),

    /// Start was requested from inside a run that is shutting down
    #[error("watch loop is stopping; start it again once stop has returned")]
    Stopping,

    /// The backend connection has already been closed
    #[error("notification backend is closed")]
    Closed,

    /// Configuration values are out of range
    #[error("invalid watcher configuration: {0}")]
    InvalidConfig(String),

    /// Reading a configuration file failed
    #[error("failed to read configuration: {0}")]
    Io(#[from] io::Error),

    /// A configuration file could not be parsed
    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

impl WatchError {
    /// Whether the watcher instance can keep operating after this error
    ///
    /// The watch loop ends its run on an unrecoverable wait or read failure.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::BackendUnavailable(_) | Self::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_backend_is_not_recoverable() {
        assert!(!WatchError::Closed.is_recoverable());
        assert!(!WatchError::BackendUnavailable(io::Error::from(io::ErrorKind::NotFound)).is_recoverable());
        assert!(WatchError::ReadFailed(io::Error::from(io::ErrorKind::Interrupted)).is_recoverable());
        assert!(WatchError::Stopping.is_recoverable());
    }
}
