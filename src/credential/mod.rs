// Core
mod config;
mod key;
mod lock;
mod registry;
mod source;
mod token_cache;
pub(crate) mod time_utils;

// Backends and vendor endpoints
pub mod storage;
pub mod vendor;

// Metrics (optional feature)
#[cfg(feature = "metrics")]
pub mod metrics;

pub use config::{CacheConfig, ConfigPreset};
pub use key::{CredentialKeys, CredentialKind, KeyNamespacer};
pub use lock::{CacheLock, DistributedLock, LockGuard};
pub use registry::CredentialRegistry;
pub use source::{CredentialSource, ExchangeFn, FetchFuture, FetchedToken, RefreshFn};
pub use token_cache::{TokenCache, TokenCacheBuilder};
pub use vendor::{ApiHost, TicketKind, TokenEndpoint, TokenResponse, VendorClient, call_with_token};

#[cfg(feature = "metrics")]
pub use metrics::{
    ErrorMetrics, InMemoryMetricsCollector, MetricEvent, MetricsCollector, NoOpMetricsCollector,
    PerformanceMetrics, TokenMetrics,
};
