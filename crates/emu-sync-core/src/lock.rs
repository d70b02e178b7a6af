//! Exclusive run guard
//!
//! Mutating sync and upload runs hold a [`RunLock`] for their whole
//! duration. The engine depends only on the capability; [`FileRunLock`]
//! backs it with an advisory OS file lock.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::{Error, Result};

/// Capability to acquire exclusive ownership of a local tree
pub trait RunLock: Send + Sync {
    /// Try to take the lock without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if another holder owns it.
    fn acquire(&self) -> Result<Box<dyn HeldLock>>;
}

/// A held lock; dropping it releases the lock as well
pub trait HeldLock: Send {
    /// Release explicitly, surfacing any error
    fn release(self: Box<Self>) -> Result<()>;
}

/// Advisory lock on a file in the state directory.
///
/// The lock file is created on demand and never deleted; only the OS-level
/// lock state changes.
#[derive(Debug, Clone)]
pub struct FileRunLock {
    path: PathBuf,
}

impl FileRunLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RunLock for FileRunLock {
    fn acquire(&self) -> Result<Box<dyn HeldLock>> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| Error::Lock {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|source| Error::Lock {
                path: self.path.clone(),
                source,
            })?;

        file.try_lock_exclusive().map_err(|_| Error::AlreadyRunning {
            lock_path: self.path.clone(),
        })?;
        debug!(path = %self.path.display(), "acquired run lock");

        Ok(Box::new(FileLockGuard {
            file,
            path: self.path.clone(),
        }))
    }
}

struct FileLockGuard {
    file: File,
    path: PathBuf,
}

impl HeldLock for FileLockGuard {
    fn release(self: Box<Self>) -> Result<()> {
        self.file.unlock().map_err(|source| Error::Lock {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), "released run lock");
        Ok(())
    }
}

/// A lock that always succeeds, for callers that coordinate elsewhere
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRunLock;

struct NoopGuard;

impl HeldLock for NoopGuard {
    fn release(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

impl RunLock for NoopRunLock {
    fn acquire(&self) -> Result<Box<dyn HeldLock>> {
        Ok(Box::new(NoopGuard))
    }
}
