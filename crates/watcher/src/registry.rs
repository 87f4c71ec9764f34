//! Watched path registry
//!
//! Maps each watched path to its backend handle. The map lock is only held
//! around map operations, never across a backend call, so a path is parked
//! in a transitional slot while its watch is being added or removed.

use crate::error::{Result, WatchError};
use crate::platform::NotificationBackend;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

enum Slot<H> {
    /// Backend registration in progress
    Adding,
    Active(H),
    /// Backend unregistration in progress
    Removing,
}

/// Registry of watched paths and their backend handles
pub struct WatchRegistry<B: NotificationBackend> {
    backend: Arc<B>,
    slots: Mutex<HashMap<PathBuf, Slot<B::Handle>>>,
}

impl<B: NotificationBackend> WatchRegistry<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Register a watch for `path`
    ///
    /// Fails with `AlreadyWatched` if the path is registered, and leaves the
    /// registry untouched when the backend refuses the watch.
    pub fn add(&self, path: &Path) -> Result<()> {
        match self.slots.lock().entry(path.to_path_buf()) {
            Entry::Occupied(entry) => {
                return Err(match entry.get() {
                    Slot::Active(_) => WatchError::AlreadyWatched(path.to_path_buf()),
                    Slot::Adding | Slot::Removing => WatchError::InFlight(path.to_path_buf()),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(Slot::Adding);
            }
        }

        let result = self.backend.watch(path);

        let mut slots = self.slots.lock();
        match result {
            Ok(handle) => {
                debug!("Registered {:?} as {:?}", path, handle);
                slots.insert(path.to_path_buf(), Slot::Active(handle));
                info!("Watching {}", path.display());
                Ok(())
            }
            Err(e) => {
                slots.remove(path);
                warn!("Failed to watch {}: {}", path.display(), e);
                Err(e)
            }
        }
    }

    /// Drop the watch for `path`
    ///
    /// Removing a path that was never watched succeeds. On backend failure
    /// the entry stays registered.
    pub fn remove(&self, path: &Path) -> Result<()> {
        let handle = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(path) else {
                return Ok(());
            };
            match std::mem::replace(slot, Slot::Removing) {
                Slot::Active(handle) => handle,
                pending => {
                    *slot = pending;
                    return Err(WatchError::InFlight(path.to_path_buf()));
                }
            }
        };

        let result = self.backend.unwatch(path, &handle);

        let mut slots = self.slots.lock();
        match result {
            Ok(()) => {
                slots.remove(path);
                info!("Stopped watching {}", path.display());
                Ok(())
            }
            Err(e) => {
                slots.insert(path.to_path_buf(), Slot::Active(handle));
                warn!("Failed to unwatch {}: {}", path.display(), e);
                Err(e)
            }
        }
    }

    /// Whether `path` has an active watch
    pub fn contains(&self, path: &Path) -> bool {
        matches!(self.slots.lock().get(path), Some(Slot::Active(_)))
    }

    /// Paths with an active watch, sorted
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Active(_)))
            .map(|(path, _)| path.clone())
            .collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Active(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
