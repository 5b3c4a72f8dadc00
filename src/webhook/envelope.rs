//! XML envelopes around encrypted webhook payloads.

use std::collections::HashMap;

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::WxError;

/// Largest request body accepted for parsing.
pub const MAX_ENVELOPE_BYTES: usize = 1024 * 1024;

/// Leaf elements directly under the root element, by name.
///
/// Nested structures are skipped. Text and CDATA content are concatenated.
pub fn parse_fields(xml: &str) -> Result<HashMap<String, String>, WxError> {
    if xml.len() > MAX_ENVELOPE_BYTES {
        return Err(WxError::MalformedRequest("XML body too large".to_string()));
    }

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut fields = HashMap::new();
    let mut depth = 0usize;
    let mut current: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                if depth == 2 {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    fields.entry(name.clone()).or_insert_with(String::new);
                    current = Some(name);
                }
            }
            Ok(Event::Empty(e)) => {
                if depth == 1 {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    fields.entry(name).or_insert_with(String::new);
                }
            }
            Ok(Event::End(_)) => {
                if depth == 2 {
                    current = None;
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Text(t)) => {
                if let (2, Some(name)) = (depth, &current) {
                    let text = t
                        .unescape()
                        .map_err(|e| WxError::MalformedRequest(format!("Bad XML text: {e}")))?;
                    if let Some(value) = fields.get_mut(name) {
                        value.push_str(&text);
                    }
                }
            }
            Ok(Event::CData(c)) => {
                if let (2, Some(name)) = (depth, &current) {
                    let text = String::from_utf8(c.into_inner().into_owned())
                        .map_err(|_| WxError::MalformedRequest("CDATA is not UTF-8".to_string()))?;
                    if let Some(value) = fields.get_mut(name) {
                        value.push_str(&text);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(WxError::MalformedRequest(format!(
                    "XML parse error at {}: {e}",
                    reader.buffer_position()
                )));
            }
            _ => {}
        }
    }

    if depth != 0 {
        return Err(WxError::MalformedRequest("Unclosed XML element".to_string()));
    }
    Ok(fields)
}

/// Text of the root-level element `name`, if present.
pub fn extract_field(xml: &str, name: &str) -> Result<Option<String>, WxError> {
    Ok(parse_fields(xml)?.remove(name))
}

/// An inbound encrypted message: `<xml><ToUserName/><Encrypt/></xml>`.
///
/// Open-platform pushes carry `AppId` instead of `ToUserName`; either fills
/// `to_user_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    /// Receiving account or component
    pub to_user_name: String,
    /// Base64 ciphertext
    pub encrypted_payload: String,
}

impl EncryptedEnvelope {
    /// Parses a request body.
    pub fn parse(xml: &str) -> Result<Self, WxError> {
        let mut fields = parse_fields(xml)?;
        let encrypted_payload = fields
            .remove("Encrypt")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| WxError::MalformedRequest("Missing Encrypt element".to_string()))?;
        let to_user_name = fields
            .remove("ToUserName")
            .or_else(|| fields.remove("AppId"))
            .unwrap_or_default();
        Ok(Self {
            to_user_name,
            encrypted_payload,
        })
    }

    /// Renders the envelope as the vendor sends it.
    pub fn to_xml(&self) -> String {
        format!(
            "<xml><ToUserName><![CDATA[{}]]></ToUserName><Encrypt><![CDATA[{}]]></Encrypt></xml>",
            self.to_user_name, self.encrypted_payload
        )
    }
}

/// An encrypted and signed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEnvelope {
    /// Base64 ciphertext of the reply
    pub encrypt: String,
    /// Signature over `{timestamp, nonce, token, encrypt}`
    pub msg_signature: String,
    /// Seconds since the epoch
    pub timestamp: String,
    /// Fresh nonce
    pub nonce: String,
}

impl ReplyEnvelope {
    /// Renders the reply body.
    pub fn to_xml(&self) -> String {
        format!(
            "<xml><Encrypt><![CDATA[{}]]></Encrypt><MsgSignature><![CDATA[{}]]></MsgSignature><TimeStamp>{}</TimeStamp><Nonce><![CDATA[{}]]></Nonce></xml>",
            self.encrypt, self.msg_signature, self.timestamp, self.nonce
        )
    }

    /// Parses a reply body.
    pub fn parse(xml: &str) -> Result<Self, WxError> {
        let mut fields = parse_fields(xml)?;
        let mut take = |name: &str| {
            fields
                .remove(name)
                .ok_or_else(|| WxError::MalformedRequest(format!("Missing {name} element")))
        };
        Ok(Self {
            encrypt: take("Encrypt")?,
            msg_signature: take("MsgSignature")?,
            timestamp: take("TimeStamp")?,
            nonce: take("Nonce")?,
        })
    }
}
