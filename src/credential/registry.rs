//! Per-tenant [`TokenCache`] lookup.

use super::TokenCache;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Owns the token caches of every tenant a service talks to, keyed by cache key.
///
/// A registry is created by whoever constructs the service and passed to the
/// components that need it; there is no process-wide instance.
///
/// # Example
///
/// ```rust
/// use wxkit::credential::{
///     CredentialKind, CredentialRegistry, CredentialSource, KeyNamespacer, TokenCache,
/// };
/// use wxkit::credential::storage::MemoryCache;
/// use std::sync::Arc;
///
/// # async fn example() {
/// let registry = CredentialRegistry::new();
/// let cache = Arc::new(MemoryCache::new());
/// let keys = KeyNamespacer::new().keys(CredentialKind::SuiteTicket, &["suite1"]);
/// let cache_key = keys.cache_key.clone();
///
/// let ticket = registry
///     .get_or_insert_with(&cache_key, || {
///         TokenCache::builder(keys, cache, CredentialSource::read_only()).build()
///     })
///     .await;
/// assert!(!ticket.can_refresh());
/// assert_eq!(registry.len().await, 1);
/// # }
/// ```
#[derive(Default, Clone)]
pub struct CredentialRegistry {
    caches: Arc<RwLock<HashMap<String, Arc<TokenCache>>>>,
}

impl CredentialRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the cache registered under `cache_key`.
    pub async fn get(&self, cache_key: &str) -> Option<Arc<TokenCache>> {
        self.caches.read().await.get(cache_key).cloned()
    }

    /// Returns the cache under `cache_key`, creating it with `make` if absent.
    ///
    /// Concurrent callers for the same key all receive the same instance.
    pub async fn get_or_insert_with<F>(&self, cache_key: &str, make: F) -> Arc<TokenCache>
    where
        F: FnOnce() -> TokenCache,
    {
        if let Some(existing) = self.get(cache_key).await {
            return existing;
        }
        let mut caches = self.caches.write().await;
        Arc::clone(caches.entry(cache_key.to_string()).or_insert_with(|| {
            debug!(cache_key, "Registering token cache");
            Arc::new(make())
        }))
    }

    /// Like [`get_or_insert_with`](Self::get_or_insert_with), for constructors
    /// that need to await something (e.g. an upstream ticket cache).
    pub async fn get_or_insert_with_async<F, Fut>(
        &self,
        cache_key: &str,
        make: F,
    ) -> Arc<TokenCache>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TokenCache>,
    {
        if let Some(existing) = self.get(cache_key).await {
            return existing;
        }
        let created = make().await;
        self.get_or_insert_with(cache_key, move || created).await
    }

    /// Removes and returns the cache under `cache_key`. Cached values in the
    /// shared cache are left alone; use [`TokenCache::clear_access_token`] for that.
    pub async fn remove(&self, cache_key: &str) -> Option<Arc<TokenCache>> {
        self.caches.write().await.remove(cache_key)
    }

    /// Number of registered caches.
    pub async fn len(&self) -> usize {
        self.caches.read().await.len()
    }

    /// Whether no cache is registered.
    pub async fn is_empty(&self) -> bool {
        self.caches.read().await.is_empty()
    }

    /// Registered cache keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.caches.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}
