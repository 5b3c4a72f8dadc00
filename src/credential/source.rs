//! Where a credential comes from when the cache has none.

use crate::WxError;
use crate::credential::TokenCache;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// A freshly fetched credential and the lifetime the vendor declared for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedToken {
    /// Token or ticket value
    pub value: String,
    /// Lifetime declared by the vendor (`expires_in`)
    pub expires_in: Duration,
}

impl FetchedToken {
    /// Creates a token with a lifetime given in seconds.
    pub fn new(value: impl Into<String>, expires_in_secs: u64) -> Self {
        Self {
            value: value.into(),
            expires_in: Duration::from_secs(expires_in_secs),
        }
    }
}

/// Boxed future produced by a credential fetch.
pub type FetchFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, WxError>> + Send + 'a>>;

/// Fetches a credential from the vendor with the tenant's own secret.
pub type RefreshFn = Arc<dyn Fn() -> FetchFuture<'static, FetchedToken> + Send + Sync>;

/// Exchanges an upstream ticket for a credential.
pub type ExchangeFn = Arc<dyn Fn(String) -> FetchFuture<'static, FetchedToken> + Send + Sync>;

/// How a [`TokenCache`] obtains a value on a miss.
///
/// The variant is the tenant's refresh capability: a `ReadOnly` credential
/// can only ever be pushed through [`TokenCache::update_access_token`].
///
/// # Example
///
/// ```rust
/// use wxkit::credential::{CredentialSource, FetchedToken};
///
/// let source = CredentialSource::client_credential(|| async {
///     Ok(FetchedToken::new("T2", 7200))
/// });
/// assert!(source.can_refresh());
/// assert!(!CredentialSource::read_only().can_refresh());
/// ```
#[derive(Clone)]
pub enum CredentialSource {
    /// Fetched directly with the tenant's own secret.
    ClientCredential(RefreshFn),
    /// Fetched by exchanging another credential (suite ticket, component
    /// verify ticket), which is itself read through its own cache.
    TicketBound {
        /// Cache holding the upstream ticket
        ticket: Arc<TokenCache>,
        /// Exchange of the ticket for this credential
        exchange: ExchangeFn,
    },
    /// Never refreshed by this process.
    ReadOnly,
}

impl CredentialSource {
    /// Source backed by a plain async fetch function.
    pub fn client_credential<F, Fut>(fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<FetchedToken, WxError>> + Send + 'static,
    {
        Self::ClientCredential(Arc::new(move || {
            Box::pin(fetch()) as FetchFuture<'static, FetchedToken>
        }))
    }

    /// Source that reads `ticket` first and hands its value to `exchange`.
    pub fn ticket_bound<F, Fut>(ticket: Arc<TokenCache>, exchange: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<FetchedToken, WxError>> + Send + 'static,
    {
        Self::TicketBound {
            ticket,
            exchange: Arc::new(move |value| {
                Box::pin(exchange(value)) as FetchFuture<'static, FetchedToken>
            }),
        }
    }

    /// Source for credentials that are only ever pushed.
    pub fn read_only() -> Self {
        Self::ReadOnly
    }

    /// Whether this process may fetch the credential itself.
    pub fn can_refresh(&self) -> bool {
        !matches!(self, Self::ReadOnly)
    }

    /// Fetches a fresh credential for the cache entry `key`.
    ///
    /// Returns a boxed future: a ticket-bound fetch awaits another
    /// [`TokenCache`], whose own fetch may land here again.
    pub(crate) fn fetch<'a>(&'a self, key: &'a str) -> FetchFuture<'a, FetchedToken> {
        Box::pin(async move {
            match self {
                Self::ClientCredential(refresh) => refresh().await,
                Self::TicketBound { ticket, exchange } => {
                    let upstream = ticket.get_access_token().await?;
                    exchange(upstream).await
                }
                Self::ReadOnly => Err(WxError::RefreshForbidden {
                    key: key.to_string(),
                }),
            }
        })
    }
}

impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientCredential(_) => f.write_str("ClientCredential"),
            Self::TicketBound { ticket, .. } => f
                .debug_struct("TicketBound")
                .field("ticket", &ticket.keys().cache_key)
                .finish(),
            Self::ReadOnly => f.write_str("ReadOnly"),
        }
    }
}
