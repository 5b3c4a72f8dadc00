// Primitives
mod cipher;
mod envelope;
mod signature;

// Exchange handling and transport
mod channel;
mod server;

pub use channel::{
    COMPONENT_VERIFY_TICKET_LIFETIME, ChannelState, DEFAULT_REPLY, HandshakeVariant,
    InboundMessage, MessageHandler, SUITE_TICKET_LIFETIME, TicketSink, WebhookChannel,
    WebhookQuery, WebhookResponse,
};
pub use cipher::{DecryptedFrame, MessageCipher, RANDOM_LEN, decode_key, decrypt, encrypt};
pub use envelope::{
    EncryptedEnvelope, MAX_ENVELOPE_BYTES, ReplyEnvelope, extract_field, parse_fields,
};
pub use server::router;
pub use signature::{SignatureEngine, sign, verify};
