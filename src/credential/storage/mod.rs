//! Pluggable key/value cache backends shared by every process serving the
//! same tenants.
//!
//! The cache is the only state the credential layer keeps. Backends must be
//! safe to share across tasks and, for anything deployed on more than one
//! instance, across processes.

use crate::WxError;
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "memory-storage")]
mod memory;
#[cfg(feature = "memory-storage")]
pub use memory::MemoryCache;

#[cfg(feature = "redis-storage")]
mod redis;
#[cfg(feature = "redis-storage")]
pub use redis::RedisCache;

/// Statistics about a cache backend.
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Number of live entries visible to this backend
    pub total_records: usize,
    /// Additional backend-specific information
    pub backend_info: String,
}

/// Abstract key/value cache with per-entry expiry.
///
/// # Available Implementations
///
/// - [`MemoryCache`] - `memory-storage` feature (default), single-process only
/// - `RedisCache` - `redis-storage` feature, shared across processes
///
/// # Error Handling
///
/// Backend failures map to [`WxError::CacheUnavailable`]. A missing key is not
/// an error: `get` returns `Ok(None)`.
///
/// # Example Implementation
///
/// ```rust
/// use wxkit::credential::storage::{KeyValueCache, StorageStats};
/// use wxkit::WxError;
/// use async_trait::async_trait;
/// use std::collections::HashMap;
/// use std::time::Duration;
/// use tokio::sync::RwLock;
///
/// /// A cache that ignores expiry entirely.
/// #[derive(Default)]
/// pub struct ForeverCache {
///     data: RwLock<HashMap<String, String>>,
/// }
///
/// #[async_trait]
/// impl KeyValueCache for ForeverCache {
///     async fn get(&self, key: &str) -> Result<Option<String>, WxError> {
///         Ok(self.data.read().await.get(key).cloned())
///     }
///
///     async fn set(&self, key: &str, value: &str, _ttl: Duration) -> Result<(), WxError> {
///         self.data.write().await.insert(key.to_string(), value.to_string());
///         Ok(())
///     }
///
///     async fn set_if_absent(
///         &self,
///         key: &str,
///         value: &str,
///         _ttl: Duration,
///     ) -> Result<bool, WxError> {
///         let mut data = self.data.write().await;
///         if data.contains_key(key) {
///             return Ok(false);
///         }
///         data.insert(key.to_string(), value.to_string());
///         Ok(true)
///     }
///
///     async fn exists(&self, key: &str) -> Result<bool, WxError> {
///         Ok(self.data.read().await.contains_key(key))
///     }
///
///     async fn delete(&self, key: &str) -> Result<(), WxError> {
///         self.data.write().await.remove(key);
///         Ok(())
///     }
///
///     async fn ttl(&self, _key: &str) -> Result<Option<Duration>, WxError> {
///         Ok(None)
///     }
///
///     async fn get_stats(&self) -> Result<StorageStats, WxError> {
///         Ok(StorageStats {
///             total_records: self.data.read().await.len(),
///             backend_info: "Forever cache".to_string(),
///         })
///     }
/// }
/// ```
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    /// Optional backend initialization (connection check, ...).
    async fn init(&self) -> Result<(), WxError> {
        Ok(())
    }

    /// Returns the value stored under `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, WxError>;

    /// Stores `value` under `key`, overwriting any previous value, expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), WxError>;

    /// Atomically stores `value` only if `key` is absent.
    ///
    /// Returns `true` if the value was stored. This is the primitive the
    /// distributed lock is built on, so it must be atomic across processes.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, WxError>;

    /// Checks whether `key` holds a live value.
    async fn exists(&self, key: &str) -> Result<bool, WxError>;

    /// Removes `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), WxError>;

    /// Remaining lifetime of `key`, or `None` if the key is absent or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, WxError>;

    /// Returns statistics about the backend.
    async fn get_stats(&self) -> Result<StorageStats, WxError>;
}
