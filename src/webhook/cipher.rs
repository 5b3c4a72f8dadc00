//! AES-256-CBC message encryption with tenant binding.
//!
//! Wire format, before encryption:
//!
//! ```text
//! random(16) | len(4, big endian) | payload(len) | tenant_id | pkcs7 pad
//! ```
//!
//! The key is the 43-character `EncodingAESKey` decoded as base64 after
//! appending `=`. The IV is the first 16 bytes of the key; the vendor fixes
//! this and both sides must agree on it. Padding uses a 32-byte block.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use rand::RngCore;

use crate::WxError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Length of the random prefix of every frame.
pub const RANDOM_LEN: usize = 16;
const LENGTH_PREFIX_LEN: usize = 4;
const PAD_BLOCK: usize = 32;
const AES_BLOCK: usize = 16;
const ENCODING_AES_KEY_LEN: usize = 43;

/// Vendor keys are random 43-character strings, so the two bits beyond the
/// 32nd byte are often non-zero.
const KEY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

/// A decrypted and unframed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedFrame {
    /// Random prefix chosen by the sender
    pub random: [u8; RANDOM_LEN],
    /// Message body, usually an XML document
    pub payload: Vec<u8>,
    /// Tenant id the sender bound the message to
    pub tenant_id: String,
}

/// Decodes a 43-character `EncodingAESKey` into the 32-byte AES key.
pub fn decode_key(encoding_aes_key: &str) -> Result<[u8; 32], WxError> {
    let encoding_aes_key = encoding_aes_key.trim();
    if encoding_aes_key.len() != ENCODING_AES_KEY_LEN {
        return Err(WxError::InvalidConfig(format!(
            "EncodingAESKey must be {} characters, got {}",
            ENCODING_AES_KEY_LEN,
            encoding_aes_key.len()
        )));
    }
    let decoded = KEY_ENGINE
        .decode(format!("{encoding_aes_key}="))
        .map_err(|e| WxError::InvalidConfig(format!("EncodingAESKey is not base64: {e}")))?;
    decoded
        .try_into()
        .map_err(|v: Vec<u8>| WxError::InvalidConfig(format!("Decoded key is {} bytes", v.len())))
}

/// Encrypts `plaintext` for `tenant_id` with a caller-chosen random prefix.
///
/// Returns base64 ciphertext.
pub fn encrypt(
    random: &[u8; RANDOM_LEN],
    plaintext: &[u8],
    tenant_id: &str,
    encoding_aes_key: &str,
) -> Result<String, WxError> {
    encrypt_with_key(&decode_key(encoding_aes_key)?, random, plaintext, tenant_id)
}

/// Decrypts and unframes base64 ciphertext without checking the tenant.
pub fn decrypt(ciphertext: &str, encoding_aes_key: &str) -> Result<DecryptedFrame, WxError> {
    decrypt_with_key(&decode_key(encoding_aes_key)?, ciphertext)
}

fn encrypt_with_key(
    key: &[u8; 32],
    random: &[u8; RANDOM_LEN],
    plaintext: &[u8],
    tenant_id: &str,
) -> Result<String, WxError> {
    let length = u32::try_from(plaintext.len())
        .map_err(|_| WxError::InvalidConfig("Plaintext too large to frame".to_string()))?;

    let frame_len = RANDOM_LEN + LENGTH_PREFIX_LEN + plaintext.len() + tenant_id.len();
    let pad = PAD_BLOCK - frame_len % PAD_BLOCK;

    let mut buf = Vec::with_capacity(frame_len + pad);
    buf.extend_from_slice(random);
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(plaintext);
    buf.extend_from_slice(tenant_id.as_bytes());
    buf.resize(frame_len + pad, pad as u8);

    let total = buf.len();
    let encrypted = Aes256CbcEnc::new_from_slices(key, &key[..AES_BLOCK])
        .map_err(|e| WxError::InvalidConfig(format!("AES key setup failed: {e}")))?
        .encrypt_padded_mut::<NoPadding>(&mut buf, total)
        .map_err(|_| WxError::InvalidConfig("Frame is not block aligned".to_string()))?;

    Ok(STANDARD.encode(encrypted))
}

fn decrypt_with_key(key: &[u8; 32], ciphertext: &str) -> Result<DecryptedFrame, WxError> {
    let mut buf = STANDARD
        .decode(ciphertext.trim())
        .map_err(|e| WxError::DecryptFailure(format!("Ciphertext is not base64: {e}")))?;
    if buf.is_empty() || buf.len() % AES_BLOCK != 0 {
        return Err(WxError::DecryptFailure(format!(
            "Ciphertext length {} is not a positive multiple of {}",
            buf.len(),
            AES_BLOCK
        )));
    }

    let decrypted = Aes256CbcDec::new_from_slices(key, &key[..AES_BLOCK])
        .map_err(|e| WxError::InvalidConfig(format!("AES key setup failed: {e}")))?
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|_| WxError::DecryptFailure("Ciphertext is not block aligned".to_string()))?;

    let frame = strip_padding(decrypted)?;
    parse_frame(frame)
}

fn strip_padding(data: &[u8]) -> Result<&[u8], WxError> {
    let pad = data.last().copied().unwrap_or(0) as usize;
    if pad == 0 || pad > PAD_BLOCK || pad > data.len() {
        return Err(WxError::DecryptFailure(format!("Invalid padding value {pad}")));
    }
    let (frame, padding) = data.split_at(data.len() - pad);
    if padding.iter().any(|&b| b as usize != pad) {
        return Err(WxError::DecryptFailure("Inconsistent padding bytes".to_string()));
    }
    Ok(frame)
}

fn parse_frame(frame: &[u8]) -> Result<DecryptedFrame, WxError> {
    let header_len = RANDOM_LEN + LENGTH_PREFIX_LEN;
    if frame.len() < header_len {
        return Err(WxError::DecryptFailure(format!(
            "Frame too short: {} bytes",
            frame.len()
        )));
    }

    let (random, rest) = frame.split_at(RANDOM_LEN);
    let (length, rest) = rest.split_at(LENGTH_PREFIX_LEN);
    let length = u32::from_be_bytes([length[0], length[1], length[2], length[3]]) as usize;
    if length > rest.len() {
        return Err(WxError::DecryptFailure(format!(
            "Declared payload length {} exceeds the {} bytes present",
            length,
            rest.len()
        )));
    }

    let (payload, tenant_id) = rest.split_at(length);
    let tenant_id = std::str::from_utf8(tenant_id)
        .map_err(|_| WxError::DecryptFailure("Tenant id is not UTF-8".to_string()))?;

    let mut random_prefix = [0u8; RANDOM_LEN];
    random_prefix.copy_from_slice(random);

    Ok(DecryptedFrame {
        random: random_prefix,
        payload: payload.to_vec(),
        tenant_id: tenant_id.to_string(),
    })
}

/// Encrypts and decrypts messages for one tenant.
///
/// # Example
///
/// ```rust
/// use wxkit::webhook::MessageCipher;
///
/// # fn example() -> Result<(), wxkit::WxError> {
/// let cipher = MessageCipher::new("AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8", "wx5823bf96d3bd56c7")?;
///
/// let ciphertext = cipher.encrypt_random(b"<xml>hi</xml>")?;
/// assert_eq!(cipher.decrypt(&ciphertext)?, b"<xml>hi</xml>");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MessageCipher {
    key: [u8; 32],
    tenant_id: String,
}

impl MessageCipher {
    /// Cipher for `tenant_id` (app id, corp id or suite id) with its `EncodingAESKey`.
    pub fn new(encoding_aes_key: &str, tenant_id: impl Into<String>) -> Result<Self, WxError> {
        Ok(Self {
            key: decode_key(encoding_aes_key)?,
            tenant_id: tenant_id.into(),
        })
    }

    /// The tenant id frames are bound to.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Encrypts with a caller-chosen random prefix.
    pub fn encrypt(&self, random: &[u8; RANDOM_LEN], plaintext: &[u8]) -> Result<String, WxError> {
        encrypt_with_key(&self.key, random, plaintext, &self.tenant_id)
    }

    /// Encrypts with a fresh random prefix.
    pub fn encrypt_random(&self, plaintext: &[u8]) -> Result<String, WxError> {
        let mut random = [0u8; RANDOM_LEN];
        rand::thread_rng().fill_bytes(&mut random);
        self.encrypt(&random, plaintext)
    }

    /// Decrypts and unframes without checking the tenant.
    pub fn decrypt_frame(&self, ciphertext: &str) -> Result<DecryptedFrame, WxError> {
        decrypt_with_key(&self.key, ciphertext)
    }

    /// Decrypts and returns the payload, rejecting frames bound to another tenant.
    pub fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, WxError> {
        let frame = self.decrypt_frame(ciphertext)?;
        if frame.tenant_id != self.tenant_id {
            return Err(WxError::TenantMismatch {
                expected: self.tenant_id.clone(),
                actual: frame.tenant_id,
            });
        }
        Ok(frame.payload)
    }
}

impl std::fmt::Debug for MessageCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCipher")
            .field("tenant_id", &self.tenant_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8";
    const TENANT: &str = "wx5823bf96d3bd56c7";
    const RANDOM: &[u8; 16] = b"0123456789abcdef";
    const PAYLOAD: &[u8] = b"<xml><Content>hello</Content></xml>";
    // AES-256-CBC, key 00..1f, IV 00..0f, 32-byte PKCS7
    const CIPHERTEXT: &str = "4j/AuRx71kQlxVlzbpsMWA+zYVKlbxqRPOFGvAzodiPI3aZb0g3rBee+UQzu/2KJvjgvWHqGhGWRX7EgJZNWwOGvQz2k5axWzU0bO+egaJKPSZCejNl3zKjcA8yDbAx+";

    #[test]
    fn test_known_vector() {
        assert_eq!(encrypt(RANDOM, PAYLOAD, TENANT, KEY).unwrap(), CIPHERTEXT);

        let frame = decrypt(CIPHERTEXT, KEY).unwrap();
        assert_eq!(&frame.random, RANDOM);
        assert_eq!(frame.payload, PAYLOAD);
        assert_eq!(frame.tenant_id, TENANT);
    }

    #[test]
    fn test_round_trip_various_lengths() {
        let cipher = MessageCipher::new(KEY, TENANT).unwrap();
        for len in [0usize, 1, 11, 12, 31, 32, 33, 1000] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let random = [len as u8; 16];
            let ciphertext = cipher.encrypt(&random, &payload).unwrap();

            let frame = cipher.decrypt_frame(&ciphertext).unwrap();
            assert_eq!(frame.random, random);
            assert_eq!(frame.payload, payload);
            assert_eq!(frame.tenant_id, TENANT);
        }
    }

    #[test]
    fn test_random_prefix_changes_ciphertext() {
        let cipher = MessageCipher::new(KEY, TENANT).unwrap();
        let a = cipher.encrypt_random(PAYLOAD).unwrap();
        let b = cipher.encrypt_random(PAYLOAD).unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), PAYLOAD);
        assert_eq!(cipher.decrypt(&b).unwrap(), PAYLOAD);
    }

    #[test]
    fn test_tenant_mismatch_rejected() {
        let sender = MessageCipher::new(KEY, "wx_tenant_one").unwrap();
        let receiver = MessageCipher::new(KEY, "wx_tenant_two").unwrap();
        let ciphertext = sender.encrypt_random(PAYLOAD).unwrap();

        let err = receiver.decrypt(&ciphertext).unwrap_err();
        assert!(matches!(
            err,
            WxError::TenantMismatch { ref expected, ref actual }
                if expected == "wx_tenant_two" && actual == "wx_tenant_one"
        ));
    }

    #[test]
    fn test_key_with_trailing_bits() {
        // Same 32 bytes; the last character differs only in the two discarded bits
        assert_eq!(
            decode_key("AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh9").unwrap(),
            decode_key(KEY).unwrap()
        );
        let key = decode_key(KEY).unwrap();
        assert_eq!(key[0], 0);
        assert_eq!(key[31], 31);
    }

    #[test]
    fn test_bad_keys() {
        assert!(matches!(decode_key("short"), Err(WxError::InvalidConfig(_))));
        assert!(matches!(
            decode_key("!!ECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8"),
            Err(WxError::InvalidConfig(_))
        ));
        assert!(MessageCipher::new(&format!("{KEY}="), TENANT).is_err());
    }

    #[test]
    fn test_malformed_ciphertext() {
        let cipher = MessageCipher::new(KEY, TENANT).unwrap();

        assert!(matches!(cipher.decrypt("not base64!"), Err(WxError::DecryptFailure(_))));
        assert!(matches!(cipher.decrypt(""), Err(WxError::DecryptFailure(_))));
        // 15 bytes: not block aligned
        assert!(matches!(
            cipher.decrypt("AAAAAAAAAAAAAAAAAAAA"),
            Err(WxError::DecryptFailure(_))
        ));
        // Truncated to the first block
        let truncated = STANDARD.encode(&STANDARD.decode(CIPHERTEXT).unwrap()[..16]);
        assert!(matches!(cipher.decrypt(&truncated), Err(WxError::DecryptFailure(_))));
    }

    #[test]
    fn test_wrong_key_fails() {
        let other =
            MessageCipher::new("ERERERERERERERERERERERERERERERERERERERERERE", TENANT).unwrap();
        assert!(other.decrypt(CIPHERTEXT).is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let cipher = MessageCipher::new(KEY, TENANT).unwrap();
        let debug = format!("{cipher:?}");
        assert!(debug.contains(TENANT));
        assert!(!debug.contains("key"));
    }
}
