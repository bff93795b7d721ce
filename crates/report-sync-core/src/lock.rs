use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SyncError;

/// Proof of a held lock. Dropping the guard releases the lock.
///
/// The guard owns whatever handle the lock manager needs to keep the lock
/// alive (an open file, a map entry, ...).
pub struct LockGuard {
    key: String,
    _handle: Box<dyn Any + Send + Sync>,
}

impl LockGuard {
    pub fn new(key: impl Into<String>, handle: Box<dyn Any + Send + Sync>) -> Self {
        Self {
            key: key.into(),
            _handle: handle,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

/// Result of a lock acquisition attempt.
#[derive(Debug)]
pub enum LockAcquireResult {
    Acquired(LockGuard),
    /// Someone else held the lock for the whole timeout.
    TryAgainLater,
}

impl LockAcquireResult {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockAcquireResult::Acquired(_))
    }
}

/// Per-document mutual exclusion across processes.
///
/// Locks are advisory and short-lived; the lifecycle store stays
/// authoritative.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Try to take the lock on `key`, waiting at most `timeout`.
    async fn acquire(&self, key: &str, timeout: Duration) -> Result<LockAcquireResult, SyncError>;
}
