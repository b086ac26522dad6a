//! Device session: the open file descriptor of a physical memory device.
//!
//! A session is opened once when its allocator is constructed and closed when
//! the allocator goes away. The descriptor is never mutated while the session
//! is open, so it can be borrowed by any number of threads at once.
//!
//! Opening may fail (missing driver, permissions, busy device). The failure is
//! recorded instead of being fatal, and every later [`DeviceSession::fd`] call
//! reports the recorded errno.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use rustix::fs::{Mode, OFlags};
use rustix::io::Errno;
use std::path::{Path, PathBuf};

#[derive(Debug)]
enum SessionState {
    /// Never opened, or closed.
    Closed,
    /// Open and usable.
    Open(OwnedFd),
    /// The last open attempt failed with this errno.
    Failed(Errno),
}

/// An open (or failed, or closed) session with a kernel memory device.
#[derive(Debug)]
pub struct DeviceSession {
    path: PathBuf,
    state: SessionState,
}

impl DeviceSession {
    /// Create a closed session for the device node at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: SessionState::Closed,
        }
    }

    /// Create an open session around an already opened descriptor.
    ///
    /// `path` is only used for diagnostics.
    pub fn from_fd(path: impl Into<PathBuf>, fd: OwnedFd) -> Self {
        Self {
            path: path.into(),
            state: SessionState::Open(fd),
        }
    }

    /// Open the device node read/write.
    ///
    /// Opening an already open session returns the existing descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceOpen`] if the node cannot be opened. The errno
    /// is remembered and reported by subsequent [`fd`](Self::fd) calls.
    pub fn open(&mut self) -> Result<BorrowedFd<'_>> {
        let path = self.path.clone();
        self.open_with(|| {
            rustix::fs::open(path.as_path(), OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())
        })
    }

    /// Open the session with a custom opener.
    ///
    /// Used by drivers whose device is not a plain node on disk.
    pub fn open_with<F>(&mut self, opener: F) -> Result<BorrowedFd<'_>>
    where
        F: FnOnce() -> std::result::Result<OwnedFd, Errno>,
    {
        if !self.is_open() {
            match opener() {
                Ok(fd) => {
                    tracing::debug!(path = %self.path.display(), fd = fd.as_raw_fd(), "opened device");
                    self.state = SessionState::Open(fd);
                }
                Err(errno) => {
                    self.state = SessionState::Failed(errno);
                    return Err(Error::DeviceOpen {
                        path: self.path.clone(),
                        source: errno,
                    });
                }
            }
        }

        self.fd().map_err(|source| Error::DeviceOpen {
            path: self.path.clone(),
            source,
        })
    }

    /// Borrow the cached descriptor.
    ///
    /// # Errors
    ///
    /// Returns the errno of the failed open, or `EBADF` if the session is
    /// closed.
    #[inline]
    pub fn fd(&self) -> std::result::Result<BorrowedFd<'_>, Errno> {
        match &self.state {
            SessionState::Open(fd) => Ok(fd.as_fd()),
            SessionState::Failed(errno) => Err(*errno),
            SessionState::Closed => Err(Errno::BADF),
        }
    }

    /// Whether the descriptor is open.
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Open(_))
    }

    /// The errno of the last failed open, if the session is in that state.
    pub fn open_error(&self) -> Option<Errno> {
        match self.state {
            SessionState::Failed(errno) => Some(errno),
            _ => None,
        }
    }

    /// Path of the device node.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the descriptor.
    ///
    /// Safe to call any number of times and after a failed open. The
    /// descriptor is closed exactly once.
    pub fn close(&mut self) {
        match std::mem::replace(&mut self.state, SessionState::Closed) {
            SessionState::Open(fd) => {
                tracing::debug!(path = %self.path.display(), fd = fd.as_raw_fd(), "closing device");
                drop(fd);
            }
            SessionState::Failed(_) | SessionState::Closed => {}
        }
    }
}
