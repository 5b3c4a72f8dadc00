use thiserror::Error;

/// Vendor error code signalling that the presented access token is no longer valid.
pub const ERRCODE_INVALID_TOKEN: i64 = 40014;

/// Vendor error code signalling a transient overload ("system busy").
pub const ERRCODE_SYSTEM_BUSY: i64 = -1;

/// Error types produced by the credential cache and the webhook channel.
///
/// The variants fall into three groups:
///
/// - **Infrastructure**: `CacheUnavailable`, `LockTimeout`, `Http`, `Cancelled`.
///   These are surfaced as-is; the only retry they ever get is the bounded
///   lock-acquisition loop.
/// - **Vendor**: `VendorRejected`, `RefreshForbidden`. Two vendor codes
///   ([`ERRCODE_INVALID_TOKEN`], [`ERRCODE_SYSTEM_BUSY`]) permit a single retry,
///   everything else is terminal.
/// - **Authentication**: `SignatureMismatch`, `DecryptFailure`, `TenantMismatch`,
///   `TimestampOutOfWindow`, `MalformedRequest`. Never retried; a webhook
///   answers them with HTTP 400.
///
/// # Example
///
/// ```rust
/// use wxkit::WxError;
///
/// fn describe(err: &WxError) -> &'static str {
///     match err {
///         WxError::LockTimeout { .. } => "try again later",
///         WxError::RefreshForbidden { .. } => "tenant cannot self-refresh",
///         e if e.is_authentication_failure() => "reject with 400",
///         _ => "internal error",
///     }
/// }
///
/// assert_eq!(describe(&WxError::SignatureMismatch), "reject with 400");
/// ```
#[derive(Error, Debug)]
pub enum WxError {
    /// The shared key/value cache could not be read or written.
    ///
    /// A cache read failure is never papered over with a vendor call: vendor
    /// token endpoints are quota-limited, and a cache outage across many
    /// instances would otherwise turn into a refresh storm.
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    /// The refresh lock could not be acquired within the retry budget.
    ///
    /// No vendor call was made. The caller may retry the whole operation later.
    #[error("Timed out acquiring refresh lock {key}")]
    LockTimeout {
        /// The lock key that stayed held
        key: String,
    },

    /// The vendor answered with a non-zero `errcode`.
    #[error("Vendor rejected request: errcode={code}, errmsg={message}")]
    VendorRejected {
        /// Vendor `errcode`
        code: i64,
        /// Vendor `errmsg`
        message: String,
    },

    /// The credential belongs to a read-only tenant and cannot be refreshed
    /// by this process; it must be pushed through `update_access_token`.
    #[error("Refresh forbidden for credential {key}")]
    RefreshForbidden {
        /// Cache key of the read-only credential
        key: String,
    },

    /// A webhook signature did not match the locally computed one.
    #[error("Signature mismatch")]
    SignatureMismatch,

    /// A webhook payload could not be decoded, decrypted or unframed.
    #[error("Decrypt failure: {0}")]
    DecryptFailure(String),

    /// The tenant id embedded in a decrypted frame is not the one this channel serves.
    #[error("Tenant mismatch: expected {expected}, got {actual}")]
    TenantMismatch {
        /// Tenant id configured on the channel
        expected: String,
        /// Tenant id recovered from the frame
        actual: String,
    },

    /// The webhook timestamp lies outside the accepted window.
    #[error("Timestamp out of window")]
    TimestampOutOfWindow,

    /// Required webhook parameters or envelope elements are missing or malformed.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Transport-level failure talking to the vendor.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Invalid configuration (bad AES key, missing cipher, ...).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The operation was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,
}

impl WxError {
    /// Wraps a storage backend message as [`WxError::CacheUnavailable`].
    pub fn from_storage_message(message: impl Into<String>) -> Self {
        Self::CacheUnavailable(message.into())
    }

    /// Returns the vendor `errcode` when this is a [`WxError::VendorRejected`].
    pub fn vendor_code(&self) -> Option<i64> {
        match self {
            Self::VendorRejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True for vendor codes that permit exactly one additional attempt.
    pub fn is_retryable_vendor_code(&self) -> bool {
        matches!(
            self.vendor_code(),
            Some(ERRCODE_INVALID_TOKEN) | Some(ERRCODE_SYSTEM_BUSY)
        )
    }

    /// True for failures that indicate tampering or misconfiguration of a
    /// webhook request. These map to HTTP 400.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            Self::SignatureMismatch
                | Self::DecryptFailure(_)
                | Self::TenantMismatch { .. }
                | Self::TimestampOutOfWindow
                | Self::MalformedRequest(_)
        )
    }

    /// Short stable identifier, used for metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CacheUnavailable(_) => "cache_unavailable",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::VendorRejected { .. } => "vendor_rejected",
            Self::RefreshForbidden { .. } => "refresh_forbidden",
            Self::SignatureMismatch => "signature_mismatch",
            Self::DecryptFailure(_) => "decrypt_failure",
            Self::TenantMismatch { .. } => "tenant_mismatch",
            Self::TimestampOutOfWindow => "timestamp_out_of_window",
            Self::MalformedRequest(_) => "malformed_request",
            Self::Http(_) => "http",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<reqwest::Error> for WxError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}
