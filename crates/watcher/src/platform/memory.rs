//! Scripted in-memory backend
//!
//! Raw record chunks are pushed through a [`RecordFeed`] and handed out one
//! chunk per read, which makes the watch loop deterministic in tests and
//! lets embedders replay captured record streams.

use super::NotificationBackend;
use crate::decoder::encode_record;
use crate::error::{Result, WatchError};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Watch handle issued by [`MemoryBackend`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryHandle(u64);

/// Backend that replays pushed record chunks
pub struct MemoryBackend {
    feed: Sender<Vec<u8>>,
    chunks: Receiver<Vec<u8>>,
    /// Chunk announced by `wait_readable` and not yet read
    ready: Mutex<Option<Vec<u8>>>,
    next_handle: AtomicU64,
    /// Active handles and the path each one watches
    watches: Mutex<HashMap<MemoryHandle, PathBuf>>,
    fail_watch: AtomicBool,
    fail_unwatch: AtomicBool,
    fail_read: AtomicBool,
    fail_close: AtomicBool,
    closed: AtomicBool,
}

/// Producer side of a [`MemoryBackend`]
#[derive(Clone)]
pub struct RecordFeed {
    tx: Sender<Vec<u8>>,
}

impl RecordFeed {
    /// Queue one raw chunk; it is returned by a single read
    pub fn push_raw(&self, bytes: Vec<u8>) {
        // The backend holds a receiver for its whole lifetime
        let _ = self.tx.send(bytes);
    }

    /// Queue one chunk built from `(mask, name)` records
    pub fn push_records(&self, records: &[(u32, &str)]) {
        let bytes = records
            .iter()
            .flat_map(|(mask, name)| encode_record(*mask, name))
            .collect();
        self.push_raw(bytes);
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (feed, chunks) = crossbeam_channel::unbounded();
        Self {
            feed,
            chunks,
            ready: Mutex::new(None),
            next_handle: AtomicU64::new(1),
            watches: Mutex::new(HashMap::new()),
            fail_watch: AtomicBool::new(false),
            fail_unwatch: AtomicBool::new(false),
            fail_read: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Get a producer for raw record chunks
    pub fn feed(&self) -> RecordFeed {
        RecordFeed {
            tx: self.feed.clone(),
        }
    }

    /// Make the next `watch` call fail
    pub fn fail_next_watch(&self) {
        self.fail_watch.store(true, Ordering::SeqCst);
    }

    /// Make the next `unwatch` call fail
    pub fn fail_next_unwatch(&self) {
        self.fail_unwatch.store(true, Ordering::SeqCst);
    }

    /// Make the next `read_raw` call fail
    pub fn fail_next_read(&self) {
        self.fail_read.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    /// Number of watches registered and not yet removed
    pub fn active_watches(&self) -> usize {
        self.watches.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(WatchError::Closed);
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn injected(operation: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("injected {} failure", operation))
}

impl NotificationBackend for MemoryBackend {
    type Handle = MemoryHandle;

    fn watch(&self, path: &Path) -> Result<MemoryHandle> {
        self.ensure_open()?;
        if self.fail_watch.swap(false, Ordering::SeqCst) {
            return Err(WatchError::WatchFailed {
                path: path.to_path_buf(),
                source: injected("watch"),
            });
        }

        let handle = MemoryHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.watches.lock().insert(handle, path.to_path_buf());
        Ok(handle)
    }

    fn unwatch(&self, path: &Path, handle: &MemoryHandle) -> Result<()> {
        self.ensure_open()?;
        if self.fail_unwatch.swap(false, Ordering::SeqCst) {
            return Err(WatchError::UnwatchFailed {
                path: path.to_path_buf(),
                source: injected("unwatch"),
            });
        }

        match self.watches.lock().remove(handle) {
            Some(_) => Ok(()),
            None => Err(WatchError::UnwatchFailed {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::NotFound, "unknown watch handle"),
            }),
        }
    }

    fn wait_readable(&self, timeout: Duration) -> Result<bool> {
        self.ensure_open()?;
        if self.ready.lock().is_some() {
            return Ok(true);
        }

        match self.chunks.recv_timeout(timeout) {
            Ok(chunk) => {
                *self.ready.lock() = Some(chunk);
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(false),
        }
    }

    fn read_raw(&self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        if self.fail_read.swap(false, Ordering::SeqCst) {
            // The failed read consumes the announced chunk
            self.ready.lock().take();
            return Err(WatchError::ReadFailed(injected("read")));
        }

        let chunk = match self.ready.lock().take() {
            Some(chunk) => chunk,
            None => match self.chunks.try_recv() {
                Ok(chunk) => chunk,
                Err(_) => return Ok(0),
            },
        };

        // Oversized chunks are cut short like a partial read
        let len = chunk.len().min(buf.len());
        buf[..len].copy_from_slice(&chunk[..len]);
        Ok(len)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.watches.lock().clear();
        if self.fail_close.swap(false, Ordering::SeqCst) {
            return Err(WatchError::CloseFailed(injected("close")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{decode, FLAG_CREATE};

    #[test]
    fn test_chunk_is_read_once() {
        let backend = MemoryBackend::new();
        backend.feed().push_records(&[(FLAG_CREATE, "a.txt")]);

        assert!(backend.wait_readable(Duration::from_millis(10)).unwrap());
        let mut buf = vec![0u8; 1024];
        let len = backend.read_raw(&mut buf).unwrap();
        assert_eq!(decode(&buf[..len]).events.len(), 1);

        assert!(!backend.wait_readable(Duration::from_millis(10)).unwrap());
        assert_eq!(backend.read_raw(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_watch_bookkeeping() {
        let backend = MemoryBackend::new();
        let a = backend.watch(Path::new("/a")).unwrap();
        let b = backend.watch(Path::new("/b")).unwrap();
        assert_ne!(a, b);
        assert_eq!(backend.active_watches(), 2);

        backend.unwatch(Path::new("/a"), &a).unwrap();
        assert_eq!(backend.active_watches(), 1);
        assert!(backend.unwatch(Path::new("/a"), &a).is_err());
    }

    #[test]
    fn test_injected_failures_fire_once() {
        let backend = MemoryBackend::new();
        backend.fail_next_watch();
        assert!(matches!(
            backend.watch(Path::new("/x")),
            Err(WatchError::WatchFailed { .. })
        ));
        assert!(backend.watch(Path::new("/x")).is_ok());
    }

    #[test]
    fn test_short_buffer_truncates_chunk() {
        let backend = MemoryBackend::new();
        backend.feed().push_records(&[(FLAG_CREATE, "first"), (FLAG_CREATE, "second")]);

        let mut buf = vec![0u8; 40];
        assert!(backend.wait_readable(Duration::from_millis(10)).unwrap());
        let len = backend.read_raw(&mut buf).unwrap();
        assert_eq!(len, 40);

        let batch = decode(&buf[..len]);
        assert_eq!(batch.events.len(), 1);
        assert!(batch.truncated);
    }

    #[test]
    fn test_closed_backend_rejects_calls() {
        let backend = MemoryBackend::new();
        backend.close().unwrap();
        assert!(backend.is_closed());
        assert!(matches!(
            backend.wait_readable(Duration::from_millis(1)),
            Err(WatchError::Closed)
        ));
    }
}
