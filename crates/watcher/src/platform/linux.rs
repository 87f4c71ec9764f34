//! inotify backend for Linux
//!
//! The `inotify` crate manages the descriptor and watch registration. Waiting
//! and reading go straight through `poll(2)`/`read(2)` so the decoder sees the
//! kernel's record stream untouched. Both syscalls run under a read guard on
//! the instance, so `close` cannot release the descriptor while they are in
//! flight.

use super::NotificationBackend;
use crate::error::{Result, WatchError};
use inotify::{Inotify, WatchDescriptor, WatchMask};
use parking_lot::RwLock;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Notification backend over one inotify instance
pub struct InotifyBackend {
    /// Owned instance; `None` once closed
    inotify: RwLock<Option<Inotify>>,
}

impl InotifyBackend {
    /// Open a new inotify instance
    ///
    /// The descriptor is non-blocking and close-on-exec.
    pub fn open() -> Result<Self> {
        let inotify = Inotify::init().map_err(WatchError::BackendUnavailable)?;
        debug!("Opened inotify instance (fd {})", inotify.as_raw_fd());

        Ok(Self {
            inotify: RwLock::new(Some(inotify)),
        })
    }

    /// Run `f` against the open instance
    ///
    /// The read guard is held for the whole call, so the descriptor cannot be
    /// closed and reused underneath it.
    fn with_instance<T>(&self, f: impl FnOnce(&Inotify) -> Result<T>) -> Result<T> {
        let guard = self.inotify.read();
        let inotify = guard.as_ref().ok_or(WatchError::Closed)?;
        f(inotify)
    }
}

impl NotificationBackend for InotifyBackend {
    type Handle = WatchDescriptor;

    fn watch(&self, path: &Path) -> Result<WatchDescriptor> {
        self.with_instance(|inotify| {
            inotify
                .watches()
                .add(path, WatchMask::CREATE | WatchMask::DELETE | WatchMask::MODIFY)
                .map_err(|source| WatchError::WatchFailed {
                    path: path.to_path_buf(),
                    source,
                })
        })
    }

    fn unwatch(&self, path: &Path, handle: &WatchDescriptor) -> Result<()> {
        self.with_instance(|inotify| {
            inotify
                .watches()
                .remove(handle.clone())
                .map_err(|source| WatchError::UnwatchFailed {
                    path: path.to_path_buf(),
                    source,
                })
        })
    }

    fn wait_readable(&self, timeout: Duration) -> Result<bool> {
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        self.with_instance(|inotify| {
            let mut pollfd = libc::pollfd {
                fd: inotify.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };

            // SAFETY: pollfd is a single valid entry that outlives the call
            let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(false);
                }
                return Err(WatchError::ReadFailed(err));
            }

            Ok(ready > 0 && pollfd.revents & libc::POLLIN != 0)
        })
    }

    fn read_raw(&self, buf: &mut [u8]) -> Result<usize> {
        self.with_instance(|inotify| {
            // SAFETY: buf is valid for writes of buf.len() bytes
            let read = unsafe { libc::read(inotify.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if read < 0 {
                let err = io::Error::last_os_error();
                return match err.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(0),
                    _ => Err(WatchError::ReadFailed(err)),
                };
            }

            Ok(read as usize)
        })
    }

    fn close(&self) -> Result<()> {
        // Waits for any in-flight wait or read to release the instance
        let Some(inotify) = self.inotify.write().take() else {
            return Ok(());
        };
        debug!("Closing inotify instance (fd {})", inotify.as_raw_fd());
        inotify.close().map_err(WatchError::CloseFailed)
    }
}
