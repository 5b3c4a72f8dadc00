//! Deterministic cache/lock key derivation.
//!
//! Many tenants of many kinds share one cache. A key is the credential kind's
//! namespace followed by the tenant identifiers, joined with `.`:
//!
//! ```text
//! [prefix.]namespace.id1.id2...      cache key
//! [prefix.]namespace.id1.id2....lock lock key
//! ```
//!
//! Identifier segments are escaped (`%` → `%25`, `.` → `%2E`) so that
//! `["a.b", "c"]` and `["a", "b.c"]` never map to the same key.

use std::borrow::Cow;
use std::fmt;

/// The kinds of credentials kept in the cache. Each kind has its own namespace,
/// so the access token and the jsapi ticket of the same tenant never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    /// Official account / mini-program access token (`appid`)
    AccessToken,
    /// Access token of an account authorized to an open-platform component
    /// (`component_appid`, `authorizer_appid`)
    AuthorizerAccessToken,
    /// Refresh token pushed for an authorized account
    AuthorizerRefreshToken,
    /// Open-platform component access token (`component_appid`)
    ComponentAccessToken,
    /// Ticket pushed to a component every ten minutes (`component_appid`)
    ComponentVerifyTicket,
    /// Third-party suite access token (`suite_id`)
    SuiteAccessToken,
    /// Ticket pushed to a suite (`suite_id`)
    SuiteTicket,
    /// Permanent authorization code of a corp for a suite (`suite_id`, `corp_id`)
    PermanentCode,
    /// Enterprise access token (`corp_id`, `agent_id`) or third-party corp
    /// token (`suite_id`, `corp_id`, `agent_id`)
    CorpAccessToken,
    /// Service provider access token (`corp_id`)
    ProviderAccessToken,
    /// JS-SDK ticket
    JsapiTicket,
    /// Per-agent JS-SDK ticket of an enterprise application
    AgentJsapiTicket,
    /// Card ticket
    CardTicket,
}

impl CredentialKind {
    /// Namespace prefix for this kind.
    pub fn namespace(self) -> &'static str {
        match self {
            Self::AccessToken => "access_token",
            Self::AuthorizerAccessToken => "authorizer_access_token",
            Self::AuthorizerRefreshToken => "authorizer_refresh_token",
            Self::ComponentAccessToken => "component_access_token",
            Self::ComponentVerifyTicket => "component_verify_ticket",
            Self::SuiteAccessToken => "suite_access_token",
            Self::SuiteTicket => "suite_ticket",
            Self::PermanentCode => "permanent_code",
            Self::CorpAccessToken => "corp_access_token",
            Self::ProviderAccessToken => "provider_access_token",
            Self::JsapiTicket => "jsapi_ticket",
            Self::AgentJsapiTicket => "agent_jsapi_ticket",
            Self::CardTicket => "card_ticket",
        }
    }

    /// All kinds, in declaration order.
    pub const ALL: [CredentialKind; 13] = [
        Self::AccessToken,
        Self::AuthorizerAccessToken,
        Self::AuthorizerRefreshToken,
        Self::ComponentAccessToken,
        Self::ComponentVerifyTicket,
        Self::SuiteAccessToken,
        Self::SuiteTicket,
        Self::PermanentCode,
        Self::CorpAccessToken,
        Self::ProviderAccessToken,
        Self::JsapiTicket,
        Self::AgentJsapiTicket,
        Self::CardTicket,
    ];
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

/// The pair of keys identifying one credential in the shared cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialKeys {
    /// Key the credential value is stored under
    pub cache_key: String,
    /// Key of the refresh lock guarding this credential
    pub lock_key: String,
}

impl CredentialKeys {
    /// Builds a key pair from an already-derived cache key.
    pub fn from_cache_key(cache_key: impl Into<String>) -> Self {
        let cache_key = cache_key.into();
        let lock_key = format!("{cache_key}.lock");
        Self {
            cache_key,
            lock_key,
        }
    }
}

/// Derives [`CredentialKeys`] for tenants, optionally under an application-wide prefix.
///
/// # Example
///
/// ```rust
/// use wxkit::credential::{CredentialKind, KeyNamespacer};
///
/// let keys = KeyNamespacer::new().keys(CredentialKind::CorpAccessToken, &["suite1", "corp9", "1000002"]);
/// assert_eq!(keys.cache_key, "corp_access_token.suite1.corp9.1000002");
/// assert_eq!(keys.lock_key, "corp_access_token.suite1.corp9.1000002.lock");
/// ```
#[derive(Debug, Clone, Default)]
pub struct KeyNamespacer {
    prefix: Option<String>,
}

impl KeyNamespacer {
    /// Namespacer without an application prefix.
    pub fn new() -> Self {
        Self::default()
    }

    /// Namespacer whose keys all start with `prefix.`.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }

    /// Cache key for `kind` scoped to the given tenant identifiers.
    pub fn cache_key(&self, kind: CredentialKind, tenant_ids: &[&str]) -> String {
        let mut key = String::new();
        if let Some(prefix) = &self.prefix {
            key.push_str(&escape_segment(prefix));
            key.push('.');
        }
        key.push_str(kind.namespace());
        for id in tenant_ids {
            key.push('.');
            key.push_str(&escape_segment(id));
        }
        key
    }

    /// Cache and lock keys for `kind` scoped to the given tenant identifiers.
    pub fn keys(&self, kind: CredentialKind, tenant_ids: &[&str]) -> CredentialKeys {
        CredentialKeys::from_cache_key(self.cache_key(kind, tenant_ids))
    }
}

fn escape_segment(segment: &str) -> Cow<'_, str> {
    if !segment.contains(['.', '%']) {
        return Cow::Borrowed(segment);
    }
    let mut escaped = String::with_capacity(segment.len() + 4);
    for ch in segment.chars() {
        match ch {
            '%' => escaped.push_str("%25"),
            '.' => escaped.push_str("%2E"),
            other => escaped.push(other),
        }
    }
    Cow::Owned(escaped)
}
