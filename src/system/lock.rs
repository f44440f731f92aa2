//! Lifecycle lock for serializing state transitions
//!
//! Exactly one lifecycle mutation (bootstrap, start, stop, shutdown,
//! create, delete) may be in flight per sandbox or per orchestrator at a
//! time. Read-only state inspection never takes this lock.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another lifecycle operation is in progress")]
    Busy,

    #[error("lock acquisition was cancelled")]
    Cancelled,

    #[error("lock acquisition timed out")]
    Timeout,
}

/// A one-permit asynchronous lock handing out owned guards.
///
/// Guards are owned (not borrowed) so an exit handler running on a detached
/// task can hold the lock across await points without borrowing the owner.
#[derive(Clone)]
pub struct LifecycleLock {
    semaphore: Arc<Semaphore>,
}

impl LifecycleLock {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Acquire the lock, waiting as long as it takes.
    pub async fn acquire(&self) -> Result<LifecycleGuard, LockError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LockError::Cancelled)?;
        Ok(LifecycleGuard { _permit: permit })
    }

    /// Acquire the lock only if nobody holds it.
    pub fn try_acquire(&self) -> Result<LifecycleGuard, LockError> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(LifecycleGuard { _permit: permit }),
            Err(TryAcquireError::NoPermits) => Err(LockError::Busy),
            Err(TryAcquireError::Closed) => Err(LockError::Cancelled),
        }
    }

    /// Acquire the lock, giving up after `timeout`.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<LifecycleGuard, LockError> {
        match tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(LifecycleGuard { _permit: permit }),
            Ok(Err(_)) => Err(LockError::Cancelled),
            Err(_) => Err(LockError::Timeout),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

impl Default for LifecycleLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard releasing the lock on drop.
pub struct LifecycleGuard {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_exclusive_acquire() {
        let lock = LifecycleLock::new();
        assert!(!lock.is_locked());

        let guard = assert_ok!(lock.acquire().await);
        assert!(lock.is_locked());
        assert!(matches!(lock.try_acquire(), Err(LockError::Busy)));

        drop(guard);
        assert!(!lock.is_locked());
        let _guard = lock.try_acquire().unwrap();
    }

    #[tokio::test]
    async fn test_guard_moves_across_tasks() {
        let lock = LifecycleLock::new();
        let guard = lock.acquire().await.unwrap();

        let lock2 = lock.clone();
        let handle = tokio::spawn(async move {
            // Held by the spawning task until dropped in here.
            drop(guard);
            lock2.acquire().await.unwrap()
        });

        let _reacquired = handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_timeout() {
        let lock = LifecycleLock::new();
        let _guard = lock.acquire().await.unwrap();

        let result = lock.acquire_timeout(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(LockError::Timeout)));
    }
}
