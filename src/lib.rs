//! # wxkit
//!
//! Credential lifecycle caching and secure webhook handling for
//! messaging-platform open APIs.
//!
//! The crate has two halves:
//!
//! - **[`credential`]**: a [`TokenCache`] per (credential kind, tenant) that
//!   serves short-lived tokens from a shared key/value cache and refreshes them
//!   from the vendor under a distributed lock, so a fleet of processes makes
//!   one vendor call per expiry instead of one per process.
//! - **[`webhook`]**: a [`WebhookChannel`] per callback URL that verifies
//!   SHA-1 request signatures, decrypts AES-256-CBC payloads, checks the tenant
//!   binding and encrypts replies.
//!
//! ## Quick Start
//!
//! ### Caching an access token
//!
//! ```rust
//! use std::sync::Arc;
//! use wxkit::credential::storage::{KeyValueCache, MemoryCache};
//! use wxkit::{CredentialKind, CredentialSource, FetchedToken, KeyNamespacer, TokenCache};
//!
//! # async fn example() -> Result<(), wxkit::WxError> {
//! let cache: Arc<dyn KeyValueCache> = Arc::new(MemoryCache::new());
//! let keys = KeyNamespacer::new().keys(CredentialKind::AccessToken, &["wx_app"]);
//!
//! let source = CredentialSource::client_credential(|| async {
//!     // Call the vendor token endpoint here.
//!     Ok(FetchedToken::new("ACCESS_TOKEN", 7200))
//! });
//! let tokens = TokenCache::builder(keys, cache, source).build();
//!
//! let token = tokens.get_access_token().await?;
//! assert_eq!(token, "ACCESS_TOKEN");
//! # Ok(())
//! # }
//! ```
//!
//! ### Answering a callback
//!
//! ```rust
//! use wxkit::webhook::{InboundMessage, MessageCipher, WebhookChannel, WebhookQuery};
//!
//! # async fn example() -> Result<(), wxkit::WxError> {
//! let channel = WebhookChannel::new("callback-token")
//!     .with_cipher(MessageCipher::new("AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8", "wx_app")?);
//!
//! let query = WebhookQuery::default();
//! let response = channel
//!     .handle_post(&query, "<xml/>", &|_message: InboundMessage| async {
//!         Ok::<Option<String>, wxkit::WxError>(None)
//!     })
//!     .await;
//! assert_eq!(response.status.as_u16(), 400);
//! # Ok(())
//! # }
//! ```
//!
//! ## Storage Backends
//!
//! - `memory-storage` (default): [`credential::storage::MemoryCache`], a
//!   process-local map with per-key expiry. Fine for one process.
//! - `redis-storage`: `RedisCache`, shared between processes.
//!
//! Any other store can be plugged in by implementing
//! [`credential::storage::KeyValueCache`].
//!
//! ## Feature Flags
//!
//! - `metrics` (default): cache hit/miss, refresh and lock-wait counters
//!   through [`credential::MetricsCollector`].

pub mod credential;
pub mod webhook;

mod error;

pub use error::{ERRCODE_INVALID_TOKEN, ERRCODE_SYSTEM_BUSY, WxError};

// Re-export commonly used types
pub use credential::{
    CacheConfig, ConfigPreset, CredentialKeys, CredentialKind, CredentialRegistry,
    CredentialSource, FetchedToken, KeyNamespacer, TokenCache, VendorClient,
};
pub use webhook::{HandshakeVariant, MessageCipher, SignatureEngine, WebhookChannel};
