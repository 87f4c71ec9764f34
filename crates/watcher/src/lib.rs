//! File system change watching
//!
//! This crate provides a long-lived watcher over the kernel's change
//! notification facility with:
//! - Per-path watch registration (created, deleted and modified entries)
//! - A dedicated background thread with a bounded, cancellable wait
//! - Decoding of the raw variable-length record stream into typed events
//! - Batch fan-out to a dynamic set of subscribers
//!
//! # Example
//!
//! ```no_run
//! use fswatch::{Event, Watcher};
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let watcher = Watcher::new()?;
//! watcher.add_node("/path/to/dir")?;
//! watcher.add_subscriber(Arc::new(|events: &[Event]| -> anyhow::Result<()> {
//!     for event in events {
//!         println!("{}", event);
//!     }
//!     Ok(())
//! }));
//!
//! watcher.start()?;
//! // ...
//! watcher.stop();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod decoder;
pub mod error;
pub mod event;
pub mod platform;
pub mod registry;
pub mod subscriber;
pub mod watch_loop;

pub use config::{WatcherConfig, WatcherConfigBuilder};
pub use decoder::DecodedBatch;
pub use error::{Result, WatchError};
pub use event::{Event, EventKind};
#[cfg(target_os = "linux")]
pub use platform::InotifyBackend;
pub use platform::{MemoryBackend, NotificationBackend, RecordFeed};
pub use registry::WatchRegistry;
pub use subscriber::{DispatchReport, EventSubscriber, SubscriberRegistry};
pub use watch_loop::{StatsSnapshot, WatchLoop};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::error;

/// File system watcher
///
/// Owns the backend connection, the watched paths, the subscribers and the
/// background loop. All methods take `&self` and may be called from any
/// thread, including while the loop is reading. Dropping the watcher stops
/// the loop and then closes the backend.
pub struct Watcher<B: NotificationBackend> {
    backend: Arc<B>,
    nodes: WatchRegistry<B>,
    subscribers: Arc<SubscriberRegistry>,
    watch_loop: WatchLoop<B>,
}

#[cfg(target_os = "linux")]
impl Watcher<InotifyBackend> {
    /// Create a watcher over a fresh inotify instance with default settings
    pub fn new() -> Result<Self> {
        Self::with_config(WatcherConfig::default())
    }

    /// Create a watcher over a fresh inotify instance
    pub fn with_config(config: WatcherConfig) -> Result<Self> {
        Self::with_backend(InotifyBackend::open()?, config)
    }
}

impl<B: NotificationBackend> Watcher<B> {
    /// Create a watcher over an already opened backend
    pub fn with_backend(backend: B, config: WatcherConfig) -> Result<Self> {
        config.validate()?;

        let backend = Arc::new(backend);
        let subscribers = Arc::new(SubscriberRegistry::new());
        let watch_loop = WatchLoop::new(Arc::clone(&backend), Arc::clone(&subscribers), config);

        Ok(Self {
            nodes: WatchRegistry::new(Arc::clone(&backend)),
            backend,
            subscribers,
            watch_loop,
        })
    }

    /// Watch a directory for created, deleted and modified entries
    ///
    /// Fails with `AlreadyWatched` for a path that is already registered.
    pub fn add_node(&self, path: impl AsRef<Path>) -> Result<()> {
        self.nodes.add(path.as_ref())
    }

    /// Stop watching a directory
    ///
    /// Succeeds for paths that were never watched.
    pub fn remove_node(&self, path: impl AsRef<Path>) -> Result<()> {
        self.nodes.remove(path.as_ref())
    }

    /// Register a subscriber; returns `false` if it is already registered
    pub fn add_subscriber(&self, subscriber: Arc<dyn EventSubscriber>) -> bool {
        self.subscribers.add(subscriber)
    }

    /// Unregister a subscriber; returns `false` if it was not registered
    pub fn remove_subscriber<S: EventSubscriber + ?Sized>(&self, subscriber: &Arc<S>) -> bool {
        self.subscribers.remove(subscriber)
    }

    /// Start the background loop (no-op if running)
    pub fn start(&self) -> Result<()> {
        self.watch_loop.start()
    }

    /// Stop the background loop and wait for it to exit (no-op if stopped)
    pub fn stop(&self) {
        self.watch_loop.stop()
    }

    pub fn is_running(&self) -> bool {
        self.watch_loop.is_running()
    }

    /// Currently watched paths, sorted
    pub fn watched_nodes(&self) -> Vec<PathBuf> {
        self.nodes.paths()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Loop counters since construction
    pub fn stats(&self) -> StatsSnapshot {
        self.watch_loop.stats()
    }

    /// Get the underlying backend
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: NotificationBackend> Drop for Watcher<B> {
    fn drop(&mut self) {
        self.watch_loop.stop();
        if let Err(e) = self.backend.close() {
            error!("Failed to close watcher backend: {}", e);
        }
    }
}
