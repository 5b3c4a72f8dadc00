use std::time::Duration;

/// Predefined configuration presets for common deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPreset {
    /// Production defaults:
    /// - expire-before margin: 300 seconds
    /// - lock expiry: 60 seconds
    /// - lock retry budget: 60 seconds
    /// - lock retry interval: 200 milliseconds
    Production,

    /// Short timings for tests and local development:
    /// - expire-before margin: 300 seconds (same semantics as production)
    /// - lock expiry: 2 seconds
    /// - lock retry budget: 2 seconds
    /// - lock retry interval: 10 milliseconds
    Testing,

    /// Load configuration from environment variables.
    ///
    /// Reads configuration from:
    /// - `WXKIT_EXPIRE_BEFORE`: margin in seconds (default: 300)
    /// - `WXKIT_LOCK_EXPIRY`: lock expiry in seconds (default: 60)
    /// - `WXKIT_LOCK_RETRY_BUDGET`: total lock wait in seconds (default: 60)
    /// - `WXKIT_LOCK_RETRY_INTERVAL_MS`: sleep between lock attempts (default: 200)
    FromEnv,
}

/// Timing configuration for a [`TokenCache`](crate::credential::TokenCache).
///
/// # Example
///
/// ```rust
/// use wxkit::credential::CacheConfig;
/// use std::time::Duration;
///
/// let config = CacheConfig {
///     expire_before: Duration::from_secs(600),
///     ..CacheConfig::default()
/// };
/// assert!(config.validate().is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Subtracted from the vendor-declared lifetime before caching.
    pub expire_before: Duration,
    /// Server-side expiry of the refresh lock; the safety net for a crashed holder.
    pub lock_expiry: Duration,
    /// Total time spent retrying lock acquisition before giving up.
    pub lock_retry_budget: Duration,
    /// Sleep between lock acquisition attempts.
    pub lock_retry_interval: Duration,
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expire_before: Duration::from_secs(env_u64("WXKIT_EXPIRE_BEFORE").unwrap_or(300)),
            lock_expiry: Duration::from_secs(env_u64("WXKIT_LOCK_EXPIRY").unwrap_or(60)),
            lock_retry_budget: Duration::from_secs(
                env_u64("WXKIT_LOCK_RETRY_BUDGET").unwrap_or(60),
            ),
            lock_retry_interval: Duration::from_millis(
                env_u64("WXKIT_LOCK_RETRY_INTERVAL_MS").unwrap_or(200),
            ),
        }
    }
}

impl CacheConfig {
    /// Validates the configuration and returns any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.lock_expiry.as_secs() < 5 {
            warnings.push(
                "Very short lock expiry (< 5 seconds) may release the lock before a vendor round trip completes"
                    .to_string(),
            );
        }
        if self.lock_expiry.as_secs() > 300 {
            warnings.push(
                "Long lock expiry (> 5 minutes) delays recovery after a crashed lock holder"
                    .to_string(),
            );
        }
        if self.lock_retry_interval > self.lock_retry_budget {
            warnings.push("Lock retry interval exceeds the total retry budget".to_string());
        }
        if self.lock_retry_interval.is_zero() {
            warnings.push("Zero lock retry interval busy-loops against the cache".to_string());
        }
        if self.expire_before.as_secs() >= 7200 {
            warnings.push(
                "Expire-before margin (>= 2 hours) swallows the whole lifetime of typical vendor tokens"
                    .to_string(),
            );
        }

        warnings
    }

    /// Returns a summary of the current configuration.
    pub fn summary(&self) -> String {
        format!(
            "CacheConfig {{ Expire Before: {}s, Lock Expiry: {}s, Lock Budget: {}s, Lock Interval: {}ms }}",
            self.expire_before.as_secs(),
            self.lock_expiry.as_secs(),
            self.lock_retry_budget.as_secs(),
            self.lock_retry_interval.as_millis(),
        )
    }
}

impl From<ConfigPreset> for CacheConfig {
    fn from(preset: ConfigPreset) -> Self {
        match preset {
            ConfigPreset::Production => Self {
                expire_before: Duration::from_secs(300),
                lock_expiry: Duration::from_secs(60),
                lock_retry_budget: Duration::from_secs(60),
                lock_retry_interval: Duration::from_millis(200),
            },
            ConfigPreset::Testing => Self {
                expire_before: Duration::from_secs(300),
                lock_expiry: Duration::from_secs(2),
                lock_retry_budget: Duration::from_secs(2),
                lock_retry_interval: Duration::from_millis(10),
            },
            ConfigPreset::FromEnv => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env_vars() {
        unsafe {
            std::env::remove_var("WXKIT_EXPIRE_BEFORE");
            std::env::remove_var("WXKIT_LOCK_EXPIRY");
            std::env::remove_var("WXKIT_LOCK_RETRY_BUDGET");
            std::env::remove_var("WXKIT_LOCK_RETRY_INTERVAL_MS");
        }
    }

    #[test]
    fn test_production_preset() {
        let config = CacheConfig::from(ConfigPreset::Production);
        assert_eq!(config.expire_before.as_secs(), 300);
        assert_eq!(config.lock_expiry.as_secs(), 60);
        assert_eq!(config.lock_retry_budget.as_secs(), 60);
        assert_eq!(config.lock_retry_interval.as_millis(), 200);
    }

    #[test]
    fn test_testing_preset() {
        let config = CacheConfig::from(ConfigPreset::Testing);
        assert_eq!(config.expire_before.as_secs(), 300);
        assert_eq!(config.lock_expiry.as_secs(), 2);
        assert_eq!(config.lock_retry_interval.as_millis(), 10);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env_vars();

        unsafe {
            std::env::set_var("WXKIT_EXPIRE_BEFORE", "120");
            std::env::set_var("WXKIT_LOCK_EXPIRY", "30");
            std::env::set_var("WXKIT_LOCK_RETRY_INTERVAL_MS", "50");
        }

        let config = CacheConfig::from(ConfigPreset::FromEnv);
        assert_eq!(config.expire_before.as_secs(), 120);
        assert_eq!(config.lock_expiry.as_secs(), 30);
        assert_eq!(config.lock_retry_budget.as_secs(), 60);
        assert_eq!(config.lock_retry_interval.as_millis(), 50);

        clear_env_vars();
    }

    #[test]
    #[serial]
    fn test_unparsable_env_falls_back() {
        clear_env_vars();
        unsafe {
            std::env::set_var("WXKIT_LOCK_EXPIRY", "soon");
        }

        let config = CacheConfig::default();
        assert_eq!(config.lock_expiry.as_secs(), 60);

        clear_env_vars();
    }

    #[test]
    fn test_validation_valid_config() {
        let config = CacheConfig::from(ConfigPreset::Production);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_validation_lock_warnings() {
        let config = CacheConfig {
            lock_expiry: Duration::from_secs(1),
            ..CacheConfig::from(ConfigPreset::Production)
        };
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("Very short lock expiry")));

        let config = CacheConfig {
            lock_expiry: Duration::from_secs(900),
            ..CacheConfig::from(ConfigPreset::Production)
        };
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("Long lock expiry")));

        let config = CacheConfig {
            lock_retry_budget: Duration::from_millis(100),
            lock_retry_interval: Duration::from_millis(500),
            ..CacheConfig::from(ConfigPreset::Production)
        };
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("exceeds the total retry budget")));
    }

    #[test]
    fn test_validation_margin_warning() {
        let config = CacheConfig {
            expire_before: Duration::from_secs(7200),
            ..CacheConfig::from(ConfigPreset::Production)
        };
        assert!(
            config
                .validate()
                .iter()
                .any(|w| w.contains("Expire-before margin"))
        );
    }

    #[test]
    fn test_summary() {
        let summary = CacheConfig::from(ConfigPreset::Production).summary();
        assert!(summary.contains("Expire Before: 300s"));
        assert!(summary.contains("Lock Interval: 200ms"));
    }
}
