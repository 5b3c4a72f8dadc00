//! Sort-concatenate-SHA1 request signatures.

use crate::WxError;
use sha1::{Digest, Sha1};

/// Signs a set of fields: sorted lexicographically, concatenated without a
/// separator, SHA-1 hashed and hex encoded.
///
/// The order fields are passed in does not matter.
///
/// # Example
///
/// ```rust
/// use wxkit::webhook::sign;
///
/// assert_eq!(
///     sign(&["1409659813", "QDG6eK", "1372623149"]),
///     sign(&["QDG6eK", "1372623149", "1409659813"]),
/// );
/// ```
pub fn sign(fields: &[&str]) -> String {
    let mut sorted = fields.to_vec();
    sorted.sort_unstable();

    let mut hasher = Sha1::new();
    for field in sorted {
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Exact comparison of a received signature with a computed one.
pub fn verify(expected: &str, computed: &str) -> bool {
    expected == computed
}

/// Signs and verifies webhook requests with a tenant's callback token.
#[derive(Clone)]
pub struct SignatureEngine {
    token: String,
}

impl SignatureEngine {
    /// Engine for the callback `token` configured on the vendor console.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Three-field signature over `{timestamp, nonce, token}`.
    pub fn url_signature(&self, timestamp: &str, nonce: &str) -> String {
        sign(&[timestamp, nonce, &self.token])
    }

    /// Four-field signature over `{timestamp, nonce, token, payload}`, used for
    /// encrypted messages, encrypted echo strings and replies.
    pub fn message_signature(&self, timestamp: &str, nonce: &str, payload: &str) -> String {
        sign(&[timestamp, nonce, &self.token, payload])
    }

    /// Checks a three-field signature.
    pub fn verify_url(&self, timestamp: &str, nonce: &str, signature: &str) -> Result<(), WxError> {
        if verify(signature, &self.url_signature(timestamp, nonce)) {
            Ok(())
        } else {
            Err(WxError::SignatureMismatch)
        }
    }

    /// Checks a four-field signature.
    pub fn verify_message(
        &self,
        timestamp: &str,
        nonce: &str,
        payload: &str,
        signature: &str,
    ) -> Result<(), WxError> {
        if verify(signature, &self.message_signature(timestamp, nonce, payload)) {
            Ok(())
        } else {
            Err(WxError::SignatureMismatch)
        }
    }
}

impl std::fmt::Debug for SignatureEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureEngine").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        assert_eq!(
            sign(&["QDG6eK", "1409659813", "1372623149"]),
            "d2157f2f9079f4d6257b45edf665c43c62e60a0a"
        );
        let engine = SignatureEngine::new("QDG6eK");
        assert_eq!(
            engine.message_signature("1409659813", "1372623149", "ENCRYPTED"),
            "4b40e8d8de95809d38b58bab93c13521ebd30959"
        );
    }

    #[test]
    fn test_order_independence() {
        let fields = ["a", "bb", "c", "0"];
        let expected = sign(&fields);
        assert_eq!(sign(&["c", "a", "0", "bb"]), expected);
        assert_eq!(sign(&["0", "bb", "c", "a"]), expected);
    }

    #[test]
    fn test_any_field_change_alters_signature() {
        let engine = SignatureEngine::new("token");
        let base = engine.message_signature("1700000000", "nonce", "payload");
        assert_ne!(engine.message_signature("1700000001", "nonce", "payload"), base);
        assert_ne!(engine.message_signature("1700000000", "nonce2", "payload"), base);
        assert_ne!(engine.message_signature("1700000000", "nonce", "payload2"), base);
        assert_ne!(
            SignatureEngine::new("token2").message_signature("1700000000", "nonce", "payload"),
            base
        );
    }

    #[test]
    fn test_verify() {
        let engine = SignatureEngine::new("QDG6eK");
        assert!(
            engine
                .verify_url("1409659813", "1372623149", "d2157f2f9079f4d6257b45edf665c43c62e60a0a")
                .is_ok()
        );
        assert!(matches!(
            engine.verify_url(
                "1409659813",
                "1372623149",
                "D2157F2F9079F4D6257B45EDF665C43C62E60A0A"
            ),
            Err(WxError::SignatureMismatch)
        ));
        assert!(matches!(
            engine.verify_message(
                "1409659813",
                "1372623149",
                "OTHER",
                "4b40e8d8de95809d38b58bab93c13521ebd30959"
            ),
            Err(WxError::SignatureMismatch)
        ));
    }

    #[test]
    fn test_debug_hides_token() {
        let engine = SignatureEngine::new("very-secret");
        assert!(!format!("{engine:?}").contains("very-secret"));
    }
}
