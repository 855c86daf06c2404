//! Cross-process run lock
//!
//! Acquisition never blocks: a worker that finds the lock held skips its
//! run instead of queueing behind the active one.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fs4::FileExt;
use tracing::{debug, warn};

use crate::error::Result;

/// A named mutual-exclusion token. The lock is released when the guard
/// is dropped.
pub trait RunLock: Send + Sync {
    type Guard: Send;

    /// `Ok(None)` when another holder has the lock.
    fn try_acquire(&self) -> Result<Option<Self::Guard>>;
}

/// OS advisory lock on a file; the kernel releases it if the process dies.
#[derive(Debug, Clone)]
pub struct FileRunLock {
    path: PathBuf,
}

impl FileRunLock {
    /// Lock file `<dir>/<name>.lock`.
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(format!("{}.lock", name)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct FileLockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to release run lock");
        } else {
            debug!(path = %self.path.display(), "run lock released");
        }
    }
}

impl RunLock for FileRunLock {
    type Guard = FileLockGuard;

    fn try_acquire(&self) -> Result<Option<FileLockGuard>> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                debug!(path = %self.path.display(), "run lock acquired");
                Ok(Some(FileLockGuard {
                    file,
                    path: self.path.clone(),
                }))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process lock for tests and single-worker deployments.
#[derive(Debug, Clone, Default)]
pub struct MemoryRunLock {
    held: Arc<AtomicBool>,
}

impl MemoryRunLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

pub struct MemoryLockGuard {
    held: Arc<AtomicBool>,
}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::SeqCst);
    }
}

impl RunLock for MemoryRunLock {
    type Guard = MemoryLockGuard;

    fn try_acquire(&self) -> Result<Option<MemoryLockGuard>> {
        let acquired = self
            .held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        Ok(acquired.then(|| MemoryLockGuard {
            held: self.held.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileRunLock::new(dir.path(), "ndvi_sync");
        let other = FileRunLock::new(dir.path(), "ndvi_sync");

        let guard = lock.try_acquire().unwrap();
        assert!(guard.is_some());
        assert!(other.try_acquire().unwrap().is_none());

        drop(guard);
        assert!(other.try_acquire().unwrap().is_some());
    }

    #[test]
    fn test_file_lock_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileRunLock::new(&dir.path().join("locks"), "ndvi_sync");
        assert!(lock.try_acquire().unwrap().is_some());
        assert!(lock.path().exists());
    }

    #[test]
    fn test_memory_lock() {
        let lock = MemoryRunLock::new();
        let guard = lock.try_acquire().unwrap();
        assert!(guard.is_some());
        assert!(lock.is_held());
        assert!(lock.clone().try_acquire().unwrap().is_none());

        drop(guard);
        assert!(!lock.is_held());
    }
}
