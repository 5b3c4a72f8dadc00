use std::sync::Arc;
use std::time::Duration;
#[cfg(feature = "metrics")]
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::CacheConfig;
use super::key::CredentialKeys;
use super::lock::{CacheLock, DistributedLock, LockGuard};
use super::source::{CredentialSource, FetchedToken};
use super::storage::KeyValueCache;
use super::time_utils;
use crate::WxError;

#[cfg(feature = "metrics")]
use super::metrics::{MetricEvent, MetricsCollector, NoOpMetricsCollector};

/// Cache-or-refresh-under-lock for one named credential.
///
/// Reads are served from the shared cache. On a miss exactly one caller
/// across every process sharing the cache takes the refresh lock and calls
/// the vendor; the others wait for the lock and then find the fresh value in
/// the cache.
///
/// To create an instance, use [`TokenCache::builder`].
///
/// # Example
///
/// ```rust
/// use wxkit::credential::{
///     CredentialKind, CredentialSource, FetchedToken, KeyNamespacer, TokenCache,
/// };
/// use wxkit::credential::storage::MemoryCache;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), wxkit::WxError> {
/// let keys = KeyNamespacer::new().keys(CredentialKind::AccessToken, &["wx123"]);
/// let source = CredentialSource::client_credential(|| async {
///     Ok(FetchedToken::new("T2", 7200))
/// });
///
/// let tokens = TokenCache::builder(keys, Arc::new(MemoryCache::new()), source).build();
/// assert_eq!(tokens.get_access_token().await?, "T2");
/// # Ok(())
/// # }
/// ```
pub struct TokenCache {
    keys: CredentialKeys,
    cache: Arc<dyn KeyValueCache>,
    lock: Arc<dyn DistributedLock>,
    source: CredentialSource,
    config: CacheConfig,
    #[cfg(feature = "metrics")]
    metrics: Arc<dyn MetricsCollector>,
}

/// A builder for [`TokenCache`].
///
/// The lock defaults to a [`CacheLock`] over the same cache and the config to
/// [`CacheConfig::default`].
#[must_use = "The builder does nothing unless `.build()` is called."]
pub struct TokenCacheBuilder {
    keys: CredentialKeys,
    cache: Arc<dyn KeyValueCache>,
    source: CredentialSource,
    lock: Option<Arc<dyn DistributedLock>>,
    config: Option<CacheConfig>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<dyn MetricsCollector>>,
}

impl TokenCacheBuilder {
    /// Uses a separate lock backend instead of locking in the credential cache.
    pub fn with_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Sets the timing configuration.
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Records cache events to `collector`.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, collector: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(collector);
        self
    }

    /// Builds the cache.
    pub fn build(self) -> TokenCache {
        let lock = self
            .lock
            .unwrap_or_else(|| Arc::new(CacheLock::new(Arc::clone(&self.cache))));
        TokenCache {
            keys: self.keys,
            cache: self.cache,
            lock,
            source: self.source,
            config: self.config.unwrap_or_default(),
            #[cfg(feature = "metrics")]
            metrics: self
                .metrics
                .unwrap_or_else(|| Arc::new(NoOpMetricsCollector::new())),
        }
    }
}

impl TokenCache {
    /// Starts building a cache for the credential identified by `keys`.
    pub fn builder(
        keys: CredentialKeys,
        cache: Arc<dyn KeyValueCache>,
        source: CredentialSource,
    ) -> TokenCacheBuilder {
        TokenCacheBuilder {
            keys,
            cache,
            source,
            lock: None,
            config: None,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Cache and lock keys of this credential.
    pub fn keys(&self) -> &CredentialKeys {
        &self.keys
    }

    /// Timing configuration in effect.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether a miss can be filled by this process.
    pub fn can_refresh(&self) -> bool {
        self.source.can_refresh()
    }

    /// Returns a non-expired credential, refreshing it if the cache has none.
    ///
    /// A cache read error is returned as is, without calling the vendor. At
    /// most one vendor call is made per miss no matter how many callers are
    /// waiting, and a caller waits at most the configured lock retry budget.
    pub async fn get_access_token(&self) -> Result<String, WxError> {
        let result = self.cached_or_refresh().await;
        if let Err(e) = &result {
            self.record_error(e).await;
        }
        result
    }

    /// [`get_access_token`](Self::get_access_token), abandoned as soon as
    /// `cancel` fires.
    ///
    /// An abandoned refresh releases its lock through the guard's drop path.
    pub async fn get_access_token_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<String, WxError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(cache_key = %self.keys.cache_key, "Credential read cancelled");
                self.record_error(&WxError::Cancelled).await;
                Err(WxError::Cancelled)
            }
            result = self.get_access_token() => result,
        }
    }

    /// Stores a credential delivered by the vendor instead of fetched.
    ///
    /// Overwrites the cache unconditionally, with the same margin as a
    /// refresh. A write failure is returned to the caller.
    pub async fn update_access_token(
        &self,
        token: &str,
        expires_in: Duration,
    ) -> Result<(), WxError> {
        let fetched = FetchedToken {
            value: token.to_string(),
            expires_in,
        };
        let result = self.store(&fetched, self.config.expire_before).await;
        match &result {
            Ok(()) => info!(cache_key = %self.keys.cache_key, "Stored pushed credential"),
            Err(e) => self.record_error(e).await,
        }
        result
    }

    /// Forces a vendor call, bypassing the cached value, still serialized
    /// through the refresh lock.
    ///
    /// `expire_before` overrides the configured margin for this write.
    pub async fn refresh_access_token(
        &self,
        expire_before: Option<Duration>,
    ) -> Result<String, WxError> {
        let margin = expire_before.unwrap_or(self.config.expire_before);
        let result = match self.forbid_read_only() {
            Ok(()) => self.refresh_under_lock(false, margin).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.record_error(e).await;
        }
        result
    }

    /// Deletes the cached credential.
    pub async fn clear_access_token(&self) -> Result<(), WxError> {
        debug!(cache_key = %self.keys.cache_key, "Clearing cached credential");
        self.cache.delete(&self.keys.cache_key).await
    }

    /// Remaining cached lifetime, or `None` if nothing is cached.
    pub async fn remaining_ttl(&self) -> Result<Option<Duration>, WxError> {
        self.cache.ttl(&self.keys.cache_key).await
    }

    async fn cached_or_refresh(&self) -> Result<String, WxError> {
        if let Some(token) = self.read_cached().await? {
            debug!(cache_key = %self.keys.cache_key, "Credential cache hit");
            #[cfg(feature = "metrics")]
            self.metrics
                .record_event(MetricEvent::CacheHit {
                    key: self.keys.cache_key.clone(),
                })
                .await;
            return Ok(token);
        }

        debug!(cache_key = %self.keys.cache_key, "Credential cache miss");
        #[cfg(feature = "metrics")]
        self.metrics
            .record_event(MetricEvent::CacheMiss {
                key: self.keys.cache_key.clone(),
            })
            .await;

        self.forbid_read_only()?;
        self.refresh_under_lock(true, self.config.expire_before)
            .await
    }

    /// An empty cached value counts as a miss.
    async fn read_cached(&self) -> Result<Option<String>, WxError> {
        let value = self.cache.get(&self.keys.cache_key).await?;
        Ok(value.filter(|v| !v.is_empty()))
    }

    fn forbid_read_only(&self) -> Result<(), WxError> {
        if self.source.can_refresh() {
            Ok(())
        } else {
            Err(WxError::RefreshForbidden {
                key: self.keys.cache_key.clone(),
            })
        }
    }

    async fn refresh_under_lock(
        &self,
        double_check: bool,
        expire_before: Duration,
    ) -> Result<String, WxError> {
        let guard = self.acquire_lock().await?;
        let result = self.refresh_locked(double_check, expire_before).await;
        guard.release().await;
        result
    }

    async fn acquire_lock(&self) -> Result<LockGuard, WxError> {
        #[cfg(feature = "metrics")]
        let started = Instant::now();

        let result = LockGuard::acquire(
            Arc::clone(&self.lock),
            &self.keys.lock_key,
            self.config.lock_expiry,
            self.config.lock_retry_budget,
            self.config.lock_retry_interval,
        )
        .await;

        #[cfg(feature = "metrics")]
        self.metrics
            .record_event(MetricEvent::LockWait {
                key: self.keys.lock_key.clone(),
                duration: started.elapsed(),
                acquired: result.is_ok(),
            })
            .await;

        result
    }

    async fn refresh_locked(
        &self,
        double_check: bool,
        expire_before: Duration,
    ) -> Result<String, WxError> {
        if double_check {
            if let Some(token) = self.read_cached().await? {
                debug!(cache_key = %self.keys.cache_key, "Credential refreshed by another holder");
                return Ok(token);
            }
        }

        #[cfg(feature = "metrics")]
        let started = Instant::now();

        let fetched = self.source.fetch(&self.keys.cache_key).await;

        #[cfg(feature = "metrics")]
        self.metrics
            .record_event(MetricEvent::VendorRefresh {
                key: self.keys.cache_key.clone(),
                duration: started.elapsed(),
                success: fetched.is_ok(),
            })
            .await;

        let fetched = fetched?;
        if fetched.value.is_empty() {
            return Err(WxError::VendorRejected {
                code: 0,
                message: "vendor returned an empty credential".to_string(),
            });
        }
        info!(
            cache_key = %self.keys.cache_key,
            expires_in = fetched.expires_in.as_secs(),
            "Fetched fresh credential"
        );

        // A failed write must not discard a fetched token.
        if let Err(e) = self.store(&fetched, expire_before).await {
            warn!(cache_key = %self.keys.cache_key, error = %e, "Failed to cache fresh credential");
            self.record_error(&e).await;
        }
        Ok(fetched.value)
    }

    async fn store(&self, token: &FetchedToken, expire_before: Duration) -> Result<(), WxError> {
        let ttl = time_utils::effective_ttl(token.expires_in, expire_before);
        if ttl.is_zero() {
            warn!(
                cache_key = %self.keys.cache_key,
                expires_in = token.expires_in.as_secs(),
                "Credential lifetime does not exceed the expire-before margin; not caching"
            );
            return Ok(());
        }
        self.cache.set(&self.keys.cache_key, &token.value, ttl).await
    }

    async fn record_error(&self, error: &WxError) {
        #[cfg(feature = "metrics")]
        self.metrics
            .record_event(MetricEvent::Error {
                error_code: error.code(),
                error_message: error.to_string(),
                context: Some(self.keys.cache_key.clone()),
            })
            .await;
        #[cfg(not(feature = "metrics"))]
        let _ = error;
    }
}
