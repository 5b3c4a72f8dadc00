//! Redis cache backend.
//!
//! This is the backend for multi-instance deployments: every process that
//! points at the same Redis shares cached credentials and refresh locks.

use super::{KeyValueCache, StorageStats};
use crate::WxError;
use async_trait::async_trait;
use redis::{AsyncCommands, Client, RedisResult, aio::MultiplexedConnection};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

/// Redis-backed [`KeyValueCache`].
///
/// - Values are plain strings with a millisecond expiry (`SET ... PX`)
/// - `set_if_absent` is a single `SET ... NX PX`, atomic across processes
/// - A multiplexed connection is created lazily and reused
/// - All keys live under `key_prefix:` so statistics can `SCAN` just this crate's keys
///
/// # Example
///
/// ```rust
/// use wxkit::credential::storage::RedisCache;
/// use std::sync::Arc;
///
/// # fn example() -> Result<(), wxkit::WxError> {
/// let cache = Arc::new(RedisCache::new("redis://localhost:6379", "wxkit")?);
/// # Ok(())
/// # }
/// ```
pub struct RedisCache {
    client: Client,
    key_prefix: String,
    conn: Arc<Mutex<Option<MultiplexedConnection>>>,
}

impl RedisCache {
    /// Create a new Redis cache backend.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `key_prefix` - Prefix for all keys to avoid collisions with other applications
    pub fn new(redis_url: &str, key_prefix: &str) -> Result<Self, WxError> {
        let client = Client::open(redis_url)
            .map_err(|e| WxError::from_storage_message(format!("Redis client error: {}", e)))?;

        Ok(Self {
            client,
            key_prefix: key_prefix.to_string(),
            conn: Arc::new(Mutex::new(None)),
        })
    }

    /// Returns the shared multiplexed connection, connecting on first use.
    ///
    /// The mutex is held only to copy the handle out, never across a command.
    async fn get_connection(&self) -> Result<MultiplexedConnection, WxError> {
        let cached = self.conn.lock().await.clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        let new_conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| WxError::from_storage_message(format!("Redis connection failed: {}", e)))?;

        let mut conn_guard = self.conn.lock().await;
        // Another caller may have connected in the meantime; keep the first.
        let conn = conn_guard.get_or_insert(new_conn).clone();
        Ok(conn)
    }

    /// Maps a command result, dropping the cached connection when it broke
    /// so the next command reconnects.
    fn check<T>(&self, result: RedisResult<T>) -> Result<T, WxError> {
        result.map_err(|e| {
            if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                warn!(error = %e, "Redis connection lost; reconnecting on next command");
                if let Ok(mut conn_guard) = self.conn.try_lock() {
                    *conn_guard = None;
                }
            }
            WxError::from_storage_message(e.to_string())
        })
    }

    fn make_key(&self, key: &str) -> String {
        let mut full = String::with_capacity(self.key_prefix.len() + key.len() + 1);
        full.push_str(&self.key_prefix);
        full.push(':');
        full.push_str(key);
        full
    }

    /// Redis rejects a zero expiry; round sub-millisecond lifetimes up.
    fn expiry_millis(ttl: Duration) -> usize {
        usize::try_from(ttl.as_millis().max(1)).unwrap_or(usize::MAX)
    }

    /// Scan keys with pattern using SCAN instead of KEYS for production safety
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, WxError> {
        let mut conn = self.get_connection().await?;
        let mut keys = Vec::new();
        let mut cursor = 0u64;

        loop {
            let result = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await;
            let (new_cursor, batch): (u64, Vec<String>) = self.check(result)?;

            keys.extend(batch);
            cursor = new_cursor;

            if cursor == 0 {
                break;
            }
        }

        Ok(keys)
    }
}

#[async_trait]
impl KeyValueCache for RedisCache {
    async fn init(&self) -> Result<(), WxError> {
        let mut conn = self.get_connection().await?;

        let result: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        self.check(result)?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, WxError> {
        let mut conn = self.get_connection().await?;
        let result = conn.get(self.make_key(key)).await;
        self.check(result)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), WxError> {
        let mut conn = self.get_connection().await?;
        let result: RedisResult<Option<String>> = conn
            .set_options(
                self.make_key(key),
                value,
                redis::SetOptions::default()
                    .with_expiration(redis::SetExpiry::PX(Self::expiry_millis(ttl))),
            )
            .await;
        self.check(result)?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, WxError> {
        let mut conn = self.get_connection().await?;
        let result: RedisResult<Option<String>> = conn
            .set_options(
                self.make_key(key),
                value,
                redis::SetOptions::default()
                    .conditional_set(redis::ExistenceCheck::NX)
                    .with_expiration(redis::SetExpiry::PX(Self::expiry_millis(ttl))),
            )
            .await;

        // NX answers nil when the key already exists
        Ok(self.check(result)?.is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, WxError> {
        let mut conn = self.get_connection().await?;
        let result = conn.exists(self.make_key(key)).await;
        self.check(result)
    }

    async fn delete(&self, key: &str) -> Result<(), WxError> {
        let mut conn = self.get_connection().await?;
        let result: RedisResult<usize> = conn.del(self.make_key(key)).await;
        self.check(result)?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, WxError> {
        let mut conn = self.get_connection().await?;
        let result = conn.pttl(self.make_key(key)).await;
        let millis: i64 = self.check(result)?;

        // -2: no such key, -1: no expiry
        if millis < 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_millis(millis as u64)))
    }

    async fn get_stats(&self) -> Result<StorageStats, WxError> {
        let mut conn = self.get_connection().await?;

        let pattern = format!("{}:*", self.key_prefix);
        let keys = self.scan_keys(&pattern).await?;

        let result = redis::cmd("INFO").arg("memory").query_async(&mut conn).await;
        let info: String = self.check(result)?;

        let memory_usage = info
            .lines()
            .find(|line| line.starts_with("used_memory_human:"))
            .and_then(|line| line.split(':').nth(1))
            .map(str::trim)
            .unwrap_or("unknown");

        Ok(StorageStats {
            total_records: keys.len(),
            backend_info: format!(
                "Redis cache (memory: {}, prefix: {}, multiplexed conn)",
                memory_usage, self.key_prefix
            ),
        })
    }
}
