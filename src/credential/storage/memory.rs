//! In-memory cache backend.
//!
//! Suitable for tests and single-instance deployments. Processes do not
//! share it, so the "one refresh system-wide" guarantee degrades to "one
//! refresh per process" when several instances each use their own.

use super::{KeyValueCache, StorageStats};
use crate::WxError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(value: &str, now: Instant, ttl: Duration) -> Result<Self, WxError> {
        let expires_at = now.checked_add(ttl).ok_or_else(|| {
            WxError::from_storage_message(format!("TTL {}s is out of range", ttl.as_secs()))
        })?;
        Ok(Self {
            value: value.to_string(),
            expires_at,
        })
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// A `HashMap`-backed cache with per-entry deadlines.
///
/// Expired entries are invisible to every read and are physically removed
/// either when overwritten or by [`MemoryCache::purge_expired`].
///
/// # Example
///
/// ```rust
/// use wxkit::credential::storage::{KeyValueCache, MemoryCache};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), wxkit::WxError> {
/// let cache = MemoryCache::new();
/// cache.set("access_token.wx1", "T1", Duration::from_secs(3300)).await?;
/// assert_eq!(cache.get("access_token.wx1").await?.as_deref(), Some("T1"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default, Clone)]
pub struct MemoryCache {
    data: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl MemoryCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty cache with room for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::with_capacity(capacity))),
        }
    }

    /// Removes every expired entry, returning how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut data = self.data.write().await;
        let initial_count = data.len();
        data.retain(|_, entry| entry.is_live(now));
        initial_count - data.len()
    }
}

#[async_trait]
impl KeyValueCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, WxError> {
        let now = Instant::now();
        let data = self.data.read().await;
        Ok(data
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), WxError> {
        let entry = CacheEntry::new(value, Instant::now(), ttl)?;
        self.data.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, WxError> {
        let now = Instant::now();
        let entry = CacheEntry::new(value, now, ttl)?;
        let mut data = self.data.write().await;
        if data.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        data.insert(key.to_string(), entry);
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool, WxError> {
        let now = Instant::now();
        let data = self.data.read().await;
        Ok(data.get(key).is_some_and(|entry| entry.is_live(now)))
    }

    async fn delete(&self, key: &str) -> Result<(), WxError> {
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, WxError> {
        let now = Instant::now();
        let data = self.data.read().await;
        Ok(data
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.expires_at - now))
    }

    async fn get_stats(&self) -> Result<StorageStats, WxError> {
        let now = Instant::now();
        let data = self.data.read().await;
        let live = data.values().filter(|entry| entry.is_live(now)).count();
        Ok(StorageStats {
            total_records: live,
            backend_info: format!(
                "In-memory HashMap cache ({} live, {} stale)",
                live,
                data.len() - live
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_cache_basic_operations() -> Result<(), WxError> {
        let cache = MemoryCache::new();

        cache.set("k", "v1", Duration::from_secs(300)).await?;
        assert!(cache.exists("k").await?);
        assert_eq!(cache.get("k").await?.as_deref(), Some("v1"));

        // set overwrites unconditionally
        cache.set("k", "v2", Duration::from_secs(300)).await?;
        assert_eq!(cache.get("k").await?.as_deref(), Some("v2"));

        cache.delete("k").await?;
        assert!(!cache.exists("k").await?);
        assert_eq!(cache.get("k").await?, None);

        // deleting a missing key is fine
        cache.delete("missing").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_cache_ttl() -> Result<(), WxError> {
        let cache = MemoryCache::new();
        cache.set("k", "v", Duration::from_secs(6900)).await?;

        let ttl = cache.ttl("k").await?.expect("ttl present");
        assert!(ttl <= Duration::from_secs(6900));
        assert!(ttl > Duration::from_secs(6890));

        assert_eq!(cache.ttl("missing").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_cache_rejects_unrepresentable_ttl() -> Result<(), WxError> {
        let cache = MemoryCache::new();

        let err = cache.set("k", "v", Duration::MAX).await.unwrap_err();
        assert!(matches!(err, WxError::CacheUnavailable(_)));
        assert!(
            cache
                .set_if_absent("k", "v", Duration::MAX)
                .await
                .is_err()
        );
        assert!(!cache.exists("k").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_cache_expiry() -> Result<(), WxError> {
        let cache = MemoryCache::new();
        cache.set("short", "v", Duration::from_millis(50)).await?;
        assert!(cache.exists("short").await?);

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!cache.exists("short").await?);
        assert_eq!(cache.get("short").await?, None);
        assert_eq!(cache.ttl("short").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_cache_set_if_absent() -> Result<(), WxError> {
        let cache = MemoryCache::new();

        assert!(cache.set_if_absent("lock", "1", Duration::from_millis(50)).await?);
        assert!(!cache.set_if_absent("lock", "2", Duration::from_millis(50)).await?);
        assert_eq!(cache.get("lock").await?.as_deref(), Some("1"));

        // An expired holder no longer blocks
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.set_if_absent("lock", "3", Duration::from_secs(5)).await?);
        assert_eq!(cache.get("lock").await?.as_deref(), Some("3"));
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_cache_purge_and_stats() -> Result<(), WxError> {
        let cache = MemoryCache::with_capacity(4);
        cache.set("stale", "v", Duration::from_millis(10)).await?;
        cache.set("live", "v", Duration::from_secs(300)).await?;

        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = cache.get_stats().await?;
        assert_eq!(stats.total_records, 1);
        assert!(stats.backend_info.contains("1 stale"));

        assert_eq!(cache.purge_expired().await, 1);
        let stats = cache.get_stats().await?;
        assert!(stats.backend_info.contains("0 stale"));
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_cache_concurrent_set_if_absent() -> Result<(), WxError> {
        let cache = Arc::new(MemoryCache::new());
        let mut handles = vec![];

        for i in 0..10 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache
                    .set_if_absent("contended", &i.to_string(), Duration::from_secs(5))
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap()? {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        Ok(())
    }
}
