//! Distributed mutual exclusion on top of a shared [`KeyValueCache`].
//!
//! A lock is a key written with set-if-absent and an expiry. The expiry is a
//! safety net: a holder that crashes without unlocking blocks others only
//! until the key expires.

use crate::WxError;
use crate::credential::storage::KeyValueCache;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Mutual exclusion primitive with expiry and bounded retry.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Tries once to acquire `key`, holding it for at most `expiry`.
    async fn lock(&self, key: &str, expiry: Duration) -> Result<bool, WxError>;

    /// Releases `key` unconditionally.
    async fn unlock(&self, key: &str) -> Result<(), WxError>;

    /// Retries [`lock`](Self::lock) every `retry_sleep` until it succeeds or
    /// `total_budget` has elapsed.
    ///
    /// Returns `Ok(false)` when the budget is exhausted. Errors from the
    /// backend end the loop immediately.
    async fn lock_timeout(
        &self,
        key: &str,
        expiry: Duration,
        total_budget: Duration,
        retry_sleep: Duration,
    ) -> Result<bool, WxError> {
        let deadline = Instant::now() + total_budget;
        loop {
            if self.lock(key, expiry).await? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(retry_sleep.min(deadline - now)).await;
        }
    }
}

/// [`DistributedLock`] backed by a [`KeyValueCache`]'s atomic set-if-absent.
///
/// # Example
///
/// ```rust
/// use wxkit::credential::{CacheLock, DistributedLock};
/// use wxkit::credential::storage::MemoryCache;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), wxkit::WxError> {
/// let lock = CacheLock::new(Arc::new(MemoryCache::new()));
/// assert!(lock.lock("refresh.lock", Duration::from_secs(60)).await?);
/// assert!(!lock.lock("refresh.lock", Duration::from_secs(60)).await?);
/// lock.unlock("refresh.lock").await?;
/// # Ok(())
/// # }
/// ```
pub struct CacheLock {
    cache: Arc<dyn KeyValueCache>,
}

impl CacheLock {
    /// Creates a lock over the given cache.
    pub fn new(cache: Arc<dyn KeyValueCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl DistributedLock for CacheLock {
    async fn lock(&self, key: &str, expiry: Duration) -> Result<bool, WxError> {
        self.cache.set_if_absent(key, "1", expiry).await
    }

    async fn unlock(&self, key: &str) -> Result<(), WxError> {
        self.cache.delete(key).await
    }
}

/// An acquired lock that is released on every exit path.
///
/// Call [`release`](LockGuard::release) on the normal path. If the guard is
/// dropped without being released (the owning future panicked or was
/// cancelled), the unlock is spawned onto the current tokio runtime.
pub struct LockGuard {
    lock: Arc<dyn DistributedLock>,
    key: String,
    released: bool,
}

impl LockGuard {
    /// Acquires `key` with bounded retry.
    ///
    /// Returns [`WxError::LockTimeout`] if the lock stays held for the whole budget.
    pub async fn acquire(
        lock: Arc<dyn DistributedLock>,
        key: &str,
        expiry: Duration,
        total_budget: Duration,
        retry_sleep: Duration,
    ) -> Result<Self, WxError> {
        let acquired = lock
            .lock_timeout(key, expiry, total_budget, retry_sleep)
            .await?;
        if !acquired {
            warn!(lock_key = key, "Refresh lock still held after retry budget");
            return Err(WxError::LockTimeout {
                key: key.to_string(),
            });
        }
        debug!(lock_key = key, "Acquired refresh lock");
        Ok(Self {
            lock,
            key: key.to_string(),
            released: false,
        })
    }

    /// The lock key this guard holds.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Releases the lock. A failed unlock is logged; the expiry still frees the key.
    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.lock.unlock(&self.key).await {
            warn!(lock_key = %self.key, error = %e, "Failed to release refresh lock");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let lock = Arc::clone(&self.lock);
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lock.unlock(&key).await {
                        warn!(
                            lock_key = %key,
                            error = %e,
                            "Failed to release abandoned refresh lock"
                        );
                    }
                });
            }
            Err(_) => {
                warn!(
                    lock_key = %key,
                    "No runtime to release abandoned refresh lock; relying on expiry"
                );
            }
        }
    }
}
