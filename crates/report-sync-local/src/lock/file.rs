use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use report_sync_core::{LockAcquireResult, LockGuard, LockManager, SyncError};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// File-based lock manager using OS-level exclusive file locking.
///
/// - Opens the lock file and takes an exclusive advisory lock (flock on Unix,
///   LockFile on Windows)
/// - The open handle lives inside the returned guard; dropping the guard
///   releases the lock
/// - Process crash automatically releases the lock (OS closes file descriptors)
///
/// Lock files are stored at `{state_dir}/locks/{sha256(canonical key)}.lock`,
/// so document paths never become path components.
#[derive(Debug)]
pub struct FileLock {
    locks_dir: PathBuf,
}

/// Open, locked handle owned by a [`LockGuard`].
struct HeldLock {
    file: File,
    path: PathBuf,
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!("Released lock {}", self.path.display());
    }
}

impl FileLock {
    /// Create a new FileLock under `state_dir`.
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            locks_dir: state_dir.as_ref().join("locks"),
        }
    }

    /// Path of the lock file for a document key.
    ///
    /// Keys naming an existing file are canonicalized first so that different
    /// spellings of one path share a lock.
    fn lock_path(&self, key: &str) -> PathBuf {
        let canonical = std::fs::canonicalize(key)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| key.to_string());
        let digest = hex::encode(Sha256::digest(canonical.as_bytes()));
        self.locks_dir.join(format!("{}.lock", digest))
    }

    /// Ensure the locks directory exists.
    fn ensure_locks_dir(&self) -> Result<(), SyncError> {
        std::fs::create_dir_all(&self.locks_dir).map_err(|e| {
            SyncError::Io(format!(
                "Failed to create locks dir {}: {}",
                self.locks_dir.display(),
                e
            ))
        })
    }

    fn open(&self, path: &Path) -> Result<File, SyncError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| SyncError::Io(format!("Failed to open lock file: {}", e)))
    }
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[async_trait]
impl LockManager for FileLock {
    #[instrument(skip(self), level = "debug")]
    async fn acquire(&self, key: &str, timeout: Duration) -> Result<LockAcquireResult, SyncError> {
        self.ensure_locks_dir()?;
        let path = self.lock_path(key);
        let file = self.open(&path)?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!("Acquired lock on {} ({})", key, path.display());
                    let held = HeldLock { file, path };
                    return Ok(LockAcquireResult::Acquired(LockGuard::new(key, Box::new(held))));
                }
                Err(e) if is_contended(&e) => {
                    if tokio::time::Instant::now() >= deadline {
                        debug!("Lock on {} still held elsewhere after {:?}", key, timeout);
                        return Ok(LockAcquireResult::TryAgainLater);
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => return Err(SyncError::Lock(format!("Failed to acquire lock: {}", e))),
            }
        }
    }
}
