//! Time utilities for safe timestamp and lifetime handling.

use crate::error::WxError;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get current timestamp in seconds since Unix epoch.
pub(crate) fn current_timestamp() -> Result<i64, WxError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .map_err(|_| WxError::InvalidConfig("System time is before Unix epoch".to_string()))
}

/// Longest lifetime any cache entry is given, whatever the vendor reports.
pub(crate) const MAX_CACHE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Lifetime a credential is cached for: the vendor lifetime minus the margin,
/// clamped to `0..=MAX_CACHE_TTL`.
pub(crate) fn effective_ttl(expires_in: Duration, expire_before: Duration) -> Duration {
    expires_in.saturating_sub(expire_before).min(MAX_CACHE_TTL)
}

/// Check if a timestamp is outside the allowed time window.
pub(crate) fn is_outside_window(timestamp: i64, current_time: i64, time_window: Duration) -> bool {
    timestamp.abs_diff(current_time) > time_window.as_secs()
}
