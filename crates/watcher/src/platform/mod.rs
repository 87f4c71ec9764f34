//! Kernel notification backends
//!
//! The watch loop only depends on [`NotificationBackend`]. Each backend owns
//! one connection to its notification facility, opened by the backend's own
//! constructor and released by [`NotificationBackend::close`].

use crate::error::Result;
use std::fmt;
use std::path::Path;
use std::time::Duration;

#[cfg(target_os = "linux")]
pub mod linux;

pub mod memory;

#[cfg(target_os = "linux")]
pub use linux::InotifyBackend;
pub use memory::{MemoryBackend, MemoryHandle, RecordFeed};

/// Connection to an OS file-change facility
///
/// Implementations are shared between caller threads (watch/unwatch) and the
/// loop thread (wait/read), so every method takes `&self`.
pub trait NotificationBackend: Send + Sync + 'static {
    /// Opaque token identifying one registered path
    type Handle: Send + Sync + fmt::Debug + 'static;

    /// Register interest in creations, deletions and modifications under `path`
    fn watch(&self, path: &Path) -> Result<Self::Handle>;

    /// Drop a previously registered watch
    fn unwatch(&self, path: &Path, handle: &Self::Handle) -> Result<()>;

    /// Block until records are readable or `timeout` elapses
    ///
    /// Returns `Ok(false)` on timeout or a spurious wake.
    fn wait_readable(&self, timeout: Duration) -> Result<bool>;

    /// Read raw records into `buf`, returning the valid length
    fn read_raw(&self, buf: &mut [u8]) -> Result<usize>;

    /// Release the connection. Later calls fail with `WatchError::Closed`.
    fn close(&self) -> Result<()>;
}
