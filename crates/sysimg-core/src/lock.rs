//! Process-wide publish lock.
//!
//! An exclusive, non-blocking advisory lock on `state/global.lock`. The lock
//! is tied to the open file handle: it is released when [`PublishLock`] is
//! dropped or the process dies, so a crashed run never leaves a stale lock.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use thiserror::Error;
use tracing::debug;

/// Publish lock failures.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock file could not be opened.
    #[error("failed to open lock file {path}: {source}")]
    Open {
        /// Lock file path.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },

    /// Locking failed for a reason other than contention.
    #[error("failed to lock {path}: {source}")]
    Lock {
        /// Lock file path.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
}

/// Held exclusive access to the publish tree.
#[derive(Debug)]
pub struct PublishLock {
    path: PathBuf,
    _file: File,
}

impl PublishLock {
    /// Try to take the lock without waiting.
    ///
    /// Returns `Ok(None)` when another process holds it.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] if the lock file cannot be created or locking
    /// fails for a reason other than contention.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| LockError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("acquired publish lock {}", path.display());
                Ok(Some(Self {
                    path: path.to_path_buf(),
                    _file: file,
                }))
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                debug!("publish lock {} is held elsewhere", path.display());
                Ok(None)
            }
            Err(source) => Err(LockError::Lock {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
