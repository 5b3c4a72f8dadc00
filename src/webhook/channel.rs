//! Handshake and authenticated-message handling for one tenant's callback URL.
//!
//! Every HTTP exchange runs its own short state machine:
//!
//! ```text
//! AwaitingHandshake --verify--> Verified --handler--> Dispatched
//!        |                         |
//!        +-----------+-------------+
//!                    v
//!                 Rejected   (signature, decrypt, tenant or timestamp failure)
//! ```
//!
//! Nothing is kept between exchanges.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::cipher::MessageCipher;
use super::envelope::{self, EncryptedEnvelope, ReplyEnvelope};
use super::signature::SignatureEngine;
use crate::WxError;
use crate::credential::TokenCache;
use crate::credential::time_utils;

/// Acknowledgement body when the handler has nothing to reply.
pub const DEFAULT_REPLY: &str = "success";

/// Lifetime of a pushed `suite_ticket`.
pub const SUITE_TICKET_LIFETIME: Duration = Duration::from_secs(1800);
/// Lifetime of a pushed `component_verify_ticket`.
pub const COMPONENT_VERIFY_TICKET_LIFETIME: Duration = Duration::from_secs(12 * 3600);

/// How the URL-validation handshake is signed and answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeVariant {
    /// `signature` over `{timestamp, nonce, token}`; `echostr` is echoed verbatim.
    #[default]
    PlainEcho,
    /// `msg_signature` over `{timestamp, nonce, token, echostr}`; `echostr` is
    /// ciphertext and its decryption is echoed (enterprise and suite tenants).
    EncryptedEcho,
}

/// Where an exchange ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Nothing verified yet
    AwaitingHandshake,
    /// Signature (and, for encrypted messages, tenant binding) verified
    Verified,
    /// Verified message handed to the handler
    Dispatched,
    /// Verification failed; terminal
    Rejected,
}

/// Query parameters the vendor appends to callback requests.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebhookQuery {
    /// Seconds since the epoch, as sent
    pub timestamp: Option<String>,
    /// Random nonce
    pub nonce: Option<String>,
    /// Three-field signature
    pub signature: Option<String>,
    /// Four-field signature over the ciphertext
    pub msg_signature: Option<String>,
    /// Handshake challenge
    pub echostr: Option<String>,
    /// `aes` when the body is encrypted
    pub encrypt_type: Option<String>,
}

impl WebhookQuery {
    fn is_encrypted(&self) -> bool {
        self.encrypt_type.as_deref() == Some("aes") || self.msg_signature.is_some()
    }
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, WxError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| WxError::MalformedRequest(format!("Missing query parameter {name}")))
}

/// A verified inbound message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Decrypted (or, in plaintext mode, raw) XML body
    pub payload: Vec<u8>,
    /// Receiving account from the envelope; empty in plaintext mode
    pub to_user_name: String,
    /// Whether the message arrived encrypted
    pub encrypted: bool,
}

impl InboundMessage {
    /// The payload as text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Leaf fields of the payload XML.
    pub fn fields(&self) -> Result<std::collections::HashMap<String, String>, WxError> {
        envelope::parse_fields(&self.text())
    }
}

/// Application logic behind a callback URL.
///
/// Returns the reply XML, or `None` to acknowledge with [`DEFAULT_REPLY`].
/// Any error is answered with HTTP 500 so the vendor redelivers.
///
/// Async closures implement this trait:
///
/// ```rust
/// use wxkit::webhook::{InboundMessage, MessageHandler};
///
/// fn assert_handler<H: MessageHandler>(_: H) {}
/// assert_handler(|message: InboundMessage| async move {
///     Ok::<_, wxkit::WxError>(Some(format!("<xml><Echo>{}</Echo></xml>", message.payload.len())))
/// });
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one verified message.
    async fn handle(&self, message: InboundMessage) -> Result<Option<String>, WxError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(InboundMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<String>, WxError>> + Send + 'static,
{
    async fn handle(&self, message: InboundMessage) -> Result<Option<String>, WxError> {
        self(message).await
    }
}

/// Stores vendor-pushed tickets into their [`TokenCache`] before the handler runs.
///
/// A push whose `InfoType` is `suite_ticket` (field `SuiteTicket`) or
/// `component_verify_ticket` (field `ComponentVerifyTicket`) is written with
/// [`TokenCache::update_access_token`].
#[derive(Clone)]
pub struct TicketSink {
    tickets: Arc<TokenCache>,
}

impl TicketSink {
    /// Sink writing into `tickets`, normally a read-only cache.
    pub fn new(tickets: Arc<TokenCache>) -> Self {
        Self { tickets }
    }

    /// Stores the ticket if `message` is a ticket push. Returns whether it was one.
    pub async fn absorb(&self, message: &InboundMessage) -> Result<bool, WxError> {
        let mut fields = message.fields()?;
        let (field, lifetime) = match fields.get("InfoType").map(String::as_str) {
            Some("suite_ticket") => ("SuiteTicket", SUITE_TICKET_LIFETIME),
            Some("component_verify_ticket") => {
                ("ComponentVerifyTicket", COMPONENT_VERIFY_TICKET_LIFETIME)
            }
            _ => return Ok(false),
        };
        let ticket = fields
            .remove(field)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| WxError::MalformedRequest(format!("Ticket push without {field}")))?;

        self.tickets.update_access_token(&ticket, lifetime).await?;
        info!(cache_key = %self.tickets.keys().cache_key, "Stored pushed ticket");
        Ok(true)
    }
}

/// Outcome of one exchange, ready to be written back over HTTP.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    /// HTTP status
    pub status: StatusCode,
    /// Response body
    pub body: Vec<u8>,
    /// Final state of the exchange
    pub state: ChannelState,
    /// `Content-Type` of `body`
    pub content_type: &'static str,
}

impl WebhookResponse {
    /// Media type of echoes, acknowledgements and handler replies.
    pub const TEXT_PLAIN: &'static str = "text/plain; charset=utf-8";
    /// Media type of sealed reply envelopes.
    pub const APPLICATION_XML: &'static str = "application/xml; charset=utf-8";

    fn ok(body: Vec<u8>, state: ChannelState) -> Self {
        Self {
            status: StatusCode::OK,
            body,
            state,
            content_type: Self::TEXT_PLAIN,
        }
    }

    fn sealed(reply: &ReplyEnvelope, state: ChannelState) -> Self {
        Self {
            content_type: Self::APPLICATION_XML,
            ..Self::ok(reply.to_xml().into_bytes(), state)
        }
    }

    fn from_error(error: &WxError, state: ChannelState) -> Self {
        let (status, state) = if error.is_authentication_failure() {
            (StatusCode::BAD_REQUEST, ChannelState::Rejected)
        } else {
            (StatusCode::INTERNAL_SERVER_ERROR, state)
        };
        Self {
            status,
            body: status
                .canonical_reason()
                .unwrap_or_default()
                .as_bytes()
                .to_vec(),
            state,
            content_type: Self::TEXT_PLAIN,
        }
    }

    /// The body as text.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

struct Exchange {
    state: ChannelState,
}

impl Exchange {
    fn new() -> Self {
        Self {
            state: ChannelState::AwaitingHandshake,
        }
    }

    fn advance(&mut self, next: ChannelState) {
        debug!(from = ?self.state, to = ?next, "Webhook exchange transition");
        self.state = next;
    }
}

/// The callback endpoint of one tenant.
///
/// # Example
///
/// ```rust
/// use wxkit::webhook::{HandshakeVariant, MessageCipher, WebhookChannel, WebhookQuery};
///
/// # fn example() -> Result<(), wxkit::WxError> {
/// let cipher = MessageCipher::new("AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8", "ww_corp")?;
/// let channel = WebhookChannel::new("callback-token")
///     .with_cipher(cipher)
///     .with_variant(HandshakeVariant::EncryptedEcho);
///
/// let response = channel.handle_get(&WebhookQuery::default());
/// assert_eq!(response.status.as_u16(), 400);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct WebhookChannel {
    signer: SignatureEngine,
    cipher: Option<MessageCipher>,
    variant: HandshakeVariant,
    encrypted_replies: bool,
    timestamp_window: Option<Duration>,
    ticket_sink: Option<TicketSink>,
}

impl WebhookChannel {
    /// Channel verifying requests with the callback `token`. Plaintext only
    /// until a cipher is configured.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            signer: SignatureEngine::new(token),
            cipher: None,
            variant: HandshakeVariant::default(),
            encrypted_replies: true,
            timestamp_window: None,
            ticket_sink: None,
        }
    }

    /// Enables encrypted messages.
    #[must_use]
    pub fn with_cipher(mut self, cipher: MessageCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Selects the handshake variant.
    #[must_use]
    pub fn with_variant(mut self, variant: HandshakeVariant) -> Self {
        self.variant = variant;
        self
    }

    /// Whether replies to encrypted messages are encrypted (default `true`).
    #[must_use]
    pub fn with_encrypted_replies(mut self, encrypted: bool) -> Self {
        self.encrypted_replies = encrypted;
        self
    }

    /// Rejects requests whose timestamp is further than `window` from now.
    #[must_use]
    pub fn with_timestamp_window(mut self, window: Duration) -> Self {
        self.timestamp_window = Some(window);
        self
    }

    /// Stores pushed tickets before dispatching.
    #[must_use]
    pub fn with_ticket_sink(mut self, sink: TicketSink) -> Self {
        self.ticket_sink = Some(sink);
        self
    }

    /// The signature engine of this channel.
    pub fn signer(&self) -> &SignatureEngine {
        &self.signer
    }

    fn cipher(&self) -> Result<&MessageCipher, WxError> {
        self.cipher.as_ref().ok_or_else(|| {
            WxError::InvalidConfig("Encrypted request but no cipher configured".to_string())
        })
    }

    fn check_timestamp(&self, timestamp: &str) -> Result<(), WxError> {
        let Some(window) = self.timestamp_window else {
            return Ok(());
        };
        let timestamp: i64 = timestamp
            .parse()
            .map_err(|_| WxError::MalformedRequest(format!("Bad timestamp {timestamp}")))?;
        if time_utils::is_outside_window(timestamp, time_utils::current_timestamp()?, window) {
            return Err(WxError::TimestampOutOfWindow);
        }
        Ok(())
    }

    /// Verifies a handshake and returns the bytes to echo.
    pub fn handshake(&self, query: &WebhookQuery) -> Result<Vec<u8>, WxError> {
        let timestamp = required(&query.timestamp, "timestamp")?;
        let nonce = required(&query.nonce, "nonce")?;
        let echostr = required(&query.echostr, "echostr")?;
        self.check_timestamp(timestamp)?;

        match self.variant {
            HandshakeVariant::PlainEcho => {
                let signature = required(&query.signature, "signature")?;
                self.signer.verify_url(timestamp, nonce, signature)?;
                Ok(echostr.as_bytes().to_vec())
            }
            HandshakeVariant::EncryptedEcho => {
                let signature = required(&query.msg_signature, "msg_signature")?;
                self.signer
                    .verify_message(timestamp, nonce, echostr, signature)?;
                self.cipher()?.decrypt(echostr)
            }
        }
    }

    /// Verifies a POST and recovers the message.
    ///
    /// Encrypted: `msg_signature` over the `Encrypt` element, then decryption
    /// and tenant check. Plaintext: `signature` over `{timestamp, nonce, token}`.
    pub fn verify_message(
        &self,
        query: &WebhookQuery,
        body: &str,
    ) -> Result<InboundMessage, WxError> {
        let timestamp = required(&query.timestamp, "timestamp")?;
        let nonce = required(&query.nonce, "nonce")?;
        self.check_timestamp(timestamp)?;

        if !query.is_encrypted() {
            let signature = required(&query.signature, "signature")?;
            self.signer.verify_url(timestamp, nonce, signature)?;
            return Ok(InboundMessage {
                payload: body.as_bytes().to_vec(),
                to_user_name: String::new(),
                encrypted: false,
            });
        }

        let signature = required(&query.msg_signature, "msg_signature")?;
        let envelope = EncryptedEnvelope::parse(body)?;
        self.signer
            .verify_message(timestamp, nonce, &envelope.encrypted_payload, signature)?;
        let payload = self.cipher()?.decrypt(&envelope.encrypted_payload)?;

        Ok(InboundMessage {
            payload,
            to_user_name: envelope.to_user_name,
            encrypted: true,
        })
    }

    /// Encrypts and signs `reply` with a fresh random prefix, timestamp and nonce.
    pub fn seal_reply(&self, reply: &str) -> Result<ReplyEnvelope, WxError> {
        let encrypt = self.cipher()?.encrypt_random(reply.as_bytes())?;
        let timestamp = time_utils::current_timestamp()?.to_string();
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let msg_signature = self.signer.message_signature(&timestamp, &nonce, &encrypt);
        Ok(ReplyEnvelope {
            encrypt,
            msg_signature,
            timestamp,
            nonce,
        })
    }

    /// Answers a GET (handshake) exchange.
    pub fn handle_get(&self, query: &WebhookQuery) -> WebhookResponse {
        let mut exchange = Exchange::new();
        match self.handshake(query) {
            Ok(echo) => {
                exchange.advance(ChannelState::Verified);
                info!(variant = ?self.variant, "Webhook handshake verified");
                WebhookResponse::ok(echo, exchange.state)
            }
            Err(e) => {
                warn!(error = %e, code = e.code(), "Webhook handshake rejected");
                WebhookResponse::from_error(&e, exchange.state)
            }
        }
    }

    /// Answers a POST exchange: verify, store pushed tickets, dispatch, reply.
    pub async fn handle_post<H>(
        &self,
        query: &WebhookQuery,
        body: &str,
        handler: &H,
    ) -> WebhookResponse
    where
        H: MessageHandler + ?Sized,
    {
        let mut exchange = Exchange::new();

        let message = match self.verify_message(query, body) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, code = e.code(), "Webhook message rejected");
                return WebhookResponse::from_error(&e, exchange.state);
            }
        };
        exchange.advance(ChannelState::Verified);

        if let Some(sink) = &self.ticket_sink {
            if let Err(e) = sink.absorb(&message).await {
                warn!(error = %e, "Failed to store pushed ticket");
                return WebhookResponse::from_error(&e, exchange.state);
            }
        }

        let encrypted = message.encrypted;
        let reply = match handler.handle(message).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Webhook handler failed");
                return WebhookResponse {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    body: b"handler error".to_vec(),
                    state: exchange.state,
                    content_type: WebhookResponse::TEXT_PLAIN,
                };
            }
        };
        exchange.advance(ChannelState::Dispatched);

        match reply {
            None => WebhookResponse::ok(DEFAULT_REPLY.as_bytes().to_vec(), exchange.state),
            Some(reply) if encrypted && self.encrypted_replies => match self.seal_reply(&reply) {
                Ok(sealed) => WebhookResponse::sealed(&sealed, exchange.state),
                Err(e) => {
                    warn!(error = %e, "Failed to encrypt webhook reply");
                    WebhookResponse::from_error(&e, exchange.state)
                }
            },
            Some(reply) => WebhookResponse::ok(reply.into_bytes(), exchange.state),
        }
    }
}

impl std::fmt::Debug for WebhookChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookChannel")
            .field("cipher", &self.cipher)
            .field("variant", &self.variant)
            .field("encrypted_replies", &self.encrypted_replies)
            .field("timestamp_window", &self.timestamp_window)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8";
    const TOKEN: &str = "QDG6eK";

    fn query(timestamp: &str, nonce: &str) -> WebhookQuery {
        WebhookQuery {
            timestamp: Some(timestamp.to_string()),
            nonce: Some(nonce.to_string()),
            ..WebhookQuery::default()
        }
    }

    #[test]
    fn test_plain_handshake() {
        let channel = WebhookChannel::new(TOKEN);
        let mut q = query("1409659813", "1372623149");
        q.signature = Some("d2157f2f9079f4d6257b45edf665c43c62e60a0a".to_string());
        q.echostr = Some("echo-me".to_string());

        assert_eq!(channel.handshake(&q).unwrap(), b"echo-me");

        let response = channel.handle_get(&q);
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.state, ChannelState::Verified);
        assert_eq!(response.body_text(), "echo-me");
    }

    #[test]
    fn test_plain_handshake_bad_signature() {
        let channel = WebhookChannel::new(TOKEN);
        let mut q = query("1409659813", "1372623149");
        q.signature = Some("0".repeat(40));
        q.echostr = Some("echo-me".to_string());

        let response = channel.handle_get(&q);
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(response.state, ChannelState::Rejected);
    }

    #[test]
    fn test_encrypted_handshake() {
        let cipher = MessageCipher::new(KEY, "ww_corp").unwrap();
        let channel = WebhookChannel::new(TOKEN)
            .with_cipher(cipher.clone())
            .with_variant(HandshakeVariant::EncryptedEcho);

        let echostr = cipher.encrypt_random(b"1616140317555161061").unwrap();
        let mut q = query("1700000000", "n");
        q.msg_signature = Some(channel.signer().message_signature("1700000000", "n", &echostr));
        q.echostr = Some(echostr);

        assert_eq!(channel.handshake(&q).unwrap(), b"1616140317555161061");
    }

    #[test]
    fn test_encrypted_handshake_requires_cipher() {
        let channel = WebhookChannel::new(TOKEN).with_variant(HandshakeVariant::EncryptedEcho);
        let mut q = query("1700000000", "n");
        q.echostr = Some("abc".to_string());
        q.msg_signature = Some(channel.signer().message_signature("1700000000", "n", "abc"));

        let response = channel.handle_get(&q);
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.state, ChannelState::AwaitingHandshake);
    }

    #[test]
    fn test_missing_parameters() {
        let channel = WebhookChannel::new(TOKEN);
        let err = channel.handshake(&WebhookQuery::default()).unwrap_err();
        assert!(matches!(err, WxError::MalformedRequest(ref m) if m.contains("timestamp")));
    }

    #[test]
    fn test_timestamp_window() {
        let channel = WebhookChannel::new(TOKEN).with_timestamp_window(Duration::from_secs(300));
        let mut q = query("1409659813", "1372623149");
        q.signature = Some("d2157f2f9079f4d6257b45edf665c43c62e60a0a".to_string());
        q.echostr = Some("e".to_string());
        assert!(matches!(channel.handshake(&q), Err(WxError::TimestampOutOfWindow)));

        let now = time_utils::current_timestamp().unwrap().to_string();
        let mut q = query(&now, "n");
        q.signature = Some(channel.signer().url_signature(&now, "n"));
        q.echostr = Some("e".to_string());
        assert!(channel.handshake(&q).is_ok());

        let mut q = query("yesterday", "n");
        q.signature = Some(channel.signer().url_signature("yesterday", "n"));
        q.echostr = Some("e".to_string());
        assert!(matches!(channel.handshake(&q), Err(WxError::MalformedRequest(_))));
    }

    #[test]
    fn test_timestamp_window_extreme_timestamps() {
        let channel = WebhookChannel::new(TOKEN).with_timestamp_window(Duration::from_secs(300));
        for timestamp in [i64::MIN.to_string(), i64::MAX.to_string()] {
            let mut q = query(&timestamp, "n");
            q.signature = Some(channel.signer().url_signature(&timestamp, "n"));
            q.echostr = Some("e".to_string());

            let response = channel.handle_get(&q);
            assert_eq!(response.status, StatusCode::BAD_REQUEST);
            assert_eq!(response.state, ChannelState::Rejected);
        }
    }

    #[test]
    fn test_seal_reply_verifies() {
        let cipher = MessageCipher::new(KEY, "wx_app").unwrap();
        let channel = WebhookChannel::new(TOKEN).with_cipher(cipher.clone());

        let sealed = channel.seal_reply("<xml>reply</xml>").unwrap();
        assert!(
            channel
                .signer()
                .verify_message(
                    &sealed.timestamp,
                    &sealed.nonce,
                    &sealed.encrypt,
                    &sealed.msg_signature
                )
                .is_ok()
        );
        assert_eq!(cipher.decrypt(&sealed.encrypt).unwrap(), b"<xml>reply</xml>");
    }

    #[test]
    fn test_debug_hides_secrets() {
        let channel = WebhookChannel::new("very-secret-token");
        assert!(!format!("{channel:?}").contains("very-secret-token"));
    }
}
