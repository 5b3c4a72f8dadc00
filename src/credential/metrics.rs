//! Metrics for the credential cache.
//!
//! Collection is pluggable and only compiled with the `metrics` feature. A
//! [`TokenCache`](crate::credential::TokenCache) records one event per cache
//! hit, miss, vendor refresh, lock wait and error.

use crate::WxError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Snapshot of the counters tracked for credential caches.
#[derive(Debug, Clone, Default)]
pub struct TokenMetrics {
    /// Reads answered from the cache
    pub cache_hits: u64,
    /// Reads that found no usable value
    pub cache_misses: u64,
    /// Vendor refresh calls made, successful or not
    pub vendor_refreshes: u64,
    /// Vendor refresh calls that failed
    pub vendor_failures: u64,
    /// Lock acquisitions attempted
    pub lock_waits: u64,
    /// Lock acquisitions that ran out of budget
    pub lock_timeouts: u64,
    /// Error counts by category
    pub error_counts: ErrorMetrics,
    /// Timing information
    pub performance: PerformanceMetrics,
}

/// Error count metrics by category.
#[derive(Debug, Clone, Default)]
pub struct ErrorMetrics {
    /// Cache backend errors
    pub cache_unavailable: u64,
    /// Vendor rejections
    pub vendor_rejected: u64,
    /// Refresh attempts on read-only credentials
    pub refresh_forbidden: u64,
    /// Cancelled operations
    pub cancelled: u64,
    /// Other errors
    pub other_errors: u64,
}

/// Performance timing metrics.
#[derive(Debug, Clone, Default)]
pub struct PerformanceMetrics {
    /// Average vendor refresh round trip (microseconds)
    pub avg_refresh_time_us: u64,
    /// Average time spent waiting for the refresh lock (microseconds)
    pub avg_lock_wait_time_us: u64,
    /// Number of samples used for averages
    pub sample_count: u64,
}

/// Events recorded by a [`TokenCache`](crate::credential::TokenCache).
#[derive(Debug, Clone)]
pub enum MetricEvent {
    /// The cached value was returned
    CacheHit {
        /// Cache key
        key: String,
    },
    /// No usable cached value
    CacheMiss {
        /// Cache key
        key: String,
    },
    /// The credential source was called
    VendorRefresh {
        /// Cache key
        key: String,
        /// Round trip time
        duration: Duration,
        /// Whether a token came back
        success: bool,
    },
    /// The refresh lock was waited for
    LockWait {
        /// Lock key
        key: String,
        /// Time spent waiting
        duration: Duration,
        /// Whether the lock was acquired
        acquired: bool,
    },
    /// An operation failed
    Error {
        /// [`WxError::code`] of the failure
        error_code: &'static str,
        /// Error message
        error_message: String,
        /// Optional context
        context: Option<String>,
    },
}

/// Trait for metrics collection backends.
///
/// All methods may be called concurrently from many tasks.
///
/// # Example Implementation
///
/// ```rust
/// use wxkit::credential::metrics::{MetricsCollector, MetricEvent, TokenMetrics};
/// use async_trait::async_trait;
/// use tokio::sync::RwLock;
///
/// #[derive(Default)]
/// pub struct HitCounter {
///     metrics: RwLock<TokenMetrics>,
/// }
///
/// #[async_trait]
/// impl MetricsCollector for HitCounter {
///     async fn record_event(&self, event: MetricEvent) {
///         if let MetricEvent::CacheHit { .. } = event {
///             self.metrics.write().await.cache_hits += 1;
///         }
///     }
///
///     async fn get_metrics(&self) -> Result<TokenMetrics, wxkit::WxError> {
///         Ok(self.metrics.read().await.clone())
///     }
///
///     async fn reset_metrics(&self) -> Result<(), wxkit::WxError> {
///         *self.metrics.write().await = TokenMetrics::default();
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    /// Record a metric event. Must be fast; it runs on the request path.
    async fn record_event(&self, event: MetricEvent);

    /// Point-in-time snapshot of all collected metrics.
    async fn get_metrics(&self) -> Result<TokenMetrics, WxError>;

    /// Reset all metrics to zero.
    async fn reset_metrics(&self) -> Result<(), WxError>;

    /// Flush any buffered metrics.
    async fn flush(&self) -> Result<(), WxError> {
        Ok(())
    }
}

/// In-memory collector built on atomic counters.
///
/// # Example
///
/// ```rust
/// use wxkit::credential::metrics::{InMemoryMetricsCollector, MetricsCollector, MetricEvent};
///
/// # async fn example() -> Result<(), wxkit::WxError> {
/// let collector = InMemoryMetricsCollector::new();
/// collector.record_event(MetricEvent::CacheHit { key: "access_token.wx1".to_string() }).await;
///
/// let metrics = collector.get_metrics().await?;
/// assert_eq!(metrics.cache_hits, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct InMemoryMetricsCollector {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    vendor_refreshes: AtomicU64,
    vendor_failures: AtomicU64,
    lock_waits: AtomicU64,
    lock_timeouts: AtomicU64,

    cache_unavailable_errors: AtomicU64,
    vendor_rejected_errors: AtomicU64,
    refresh_forbidden_errors: AtomicU64,
    cancelled_errors: AtomicU64,
    other_errors: AtomicU64,

    refresh_time_total: AtomicU64,
    lock_wait_time_total: AtomicU64,
}

impl InMemoryMetricsCollector {
    /// Create a new in-memory metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self) -> [&AtomicU64; 13] {
        [
            &self.cache_hits,
            &self.cache_misses,
            &self.vendor_refreshes,
            &self.vendor_failures,
            &self.lock_waits,
            &self.lock_timeouts,
            &self.cache_unavailable_errors,
            &self.vendor_rejected_errors,
            &self.refresh_forbidden_errors,
            &self.cancelled_errors,
            &self.other_errors,
            &self.refresh_time_total,
            &self.lock_wait_time_total,
        ]
    }
}

fn average(total: &AtomicU64, samples: u64) -> u64 {
    if samples > 0 {
        total.load(Ordering::Relaxed) / samples
    } else {
        0
    }
}

#[async_trait]
impl MetricsCollector for InMemoryMetricsCollector {
    async fn record_event(&self, event: MetricEvent) {
        match event {
            MetricEvent::CacheHit { .. } => {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::CacheMiss { .. } => {
                self.cache_misses.fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::VendorRefresh {
                duration, success, ..
            } => {
                self.vendor_refreshes.fetch_add(1, Ordering::Relaxed);
                if !success {
                    self.vendor_failures.fetch_add(1, Ordering::Relaxed);
                }
                self.refresh_time_total
                    .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
            }
            MetricEvent::LockWait {
                duration, acquired, ..
            } => {
                self.lock_waits.fetch_add(1, Ordering::Relaxed);
                if !acquired {
                    self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                }
                self.lock_wait_time_total
                    .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
            }
            MetricEvent::Error { error_code, .. } => {
                let counter = match error_code {
                    "cache_unavailable" => &self.cache_unavailable_errors,
                    "vendor_rejected" => &self.vendor_rejected_errors,
                    "refresh_forbidden" => &self.refresh_forbidden_errors,
                    "cancelled" => &self.cancelled_errors,
                    _ => &self.other_errors,
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn get_metrics(&self) -> Result<TokenMetrics, WxError> {
        let vendor_refreshes = self.vendor_refreshes.load(Ordering::Relaxed);
        let lock_waits = self.lock_waits.load(Ordering::Relaxed);

        Ok(TokenMetrics {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            vendor_refreshes,
            vendor_failures: self.vendor_failures.load(Ordering::Relaxed),
            lock_waits,
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            error_counts: ErrorMetrics {
                cache_unavailable: self.cache_unavailable_errors.load(Ordering::Relaxed),
                vendor_rejected: self.vendor_rejected_errors.load(Ordering::Relaxed),
                refresh_forbidden: self.refresh_forbidden_errors.load(Ordering::Relaxed),
                cancelled: self.cancelled_errors.load(Ordering::Relaxed),
                other_errors: self.other_errors.load(Ordering::Relaxed),
            },
            performance: PerformanceMetrics {
                avg_refresh_time_us: average(&self.refresh_time_total, vendor_refreshes),
                avg_lock_wait_time_us: average(&self.lock_wait_time_total, lock_waits),
                sample_count: vendor_refreshes + lock_waits,
            },
        })
    }

    async fn reset_metrics(&self) -> Result<(), WxError> {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Collector that discards everything. Used when none is configured.
#[derive(Debug, Default)]
pub struct NoOpMetricsCollector;

impl NoOpMetricsCollector {
    /// Create a new no-op metrics collector.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MetricsCollector for NoOpMetricsCollector {
    async fn record_event(&self, _event: MetricEvent) {}

    async fn get_metrics(&self) -> Result<TokenMetrics, WxError> {
        Ok(TokenMetrics::default())
    }

    async fn reset_metrics(&self) -> Result<(), WxError> {
        Ok(())
    }
}
