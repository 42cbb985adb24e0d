//! Gift message encryption
//!
//! Gift messages attached to registry purchases are stored encrypted with
//! AES-256-GCM. The stored form is `v1:` followed by base64 of
//! `nonce (12 bytes) || ciphertext+tag`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;

use crate::error::CryptoError;

const VERSION_PREFIX: &str = "v1:";
const NONCE_LEN: usize = 12;

/// Maximum gift message length in characters
pub const MAX_GIFT_MESSAGE_CHARS: usize = 500;

/// AES-256-GCM cipher for gift messages
#[derive(Clone)]
pub struct GiftMessageCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for GiftMessageCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GiftMessageCipher(<redacted>)")
    }
}

impl GiftMessageCipher {
    /// Create a cipher from a 32-byte key
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Encrypt a message into its stored form
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&ciphertext);

        Ok(format!("{VERSION_PREFIX}{}", STANDARD.encode(sealed)))
    }

    /// Decrypt a stored message
    pub fn decrypt(&self, stored: &str) -> Result<String, CryptoError> {
        let encoded = stored
            .strip_prefix(VERSION_PREFIX)
            .ok_or_else(|| CryptoError::DecryptionFailed("unknown format version".to_string()))?;

        let sealed = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

        if sealed.len() <= NONCE_LEN {
            return Err(CryptoError::DecryptionFailed(
                "ciphertext too short".to_string(),
            ));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce_array: [u8; NONCE_LEN] = nonce_bytes
            .try_into()
            .map_err(|_| CryptoError::DecryptionFailed("invalid nonce length".to_string()))?;
        let nonce = Nonce::from(nonce_array);

        let plaintext = cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

        String::from_utf8(plaintext).map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}

/// Trim a gift message and cap its length; empty messages become `None`
pub fn normalize_gift_message(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_GIFT_MESSAGE_CHARS).collect())
}
