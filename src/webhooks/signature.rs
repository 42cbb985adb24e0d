//! Webhook signature verification
//!
//! The platform signs every delivery with HMAC-SHA256 over the raw request
//! body using the app's shared secret, base64-encoded into the
//! `X-Shopify-Hmac-Sha256` header. Verification must run on the raw bytes
//! before the body is parsed.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the base64 HMAC
pub const HEADER_HMAC: &str = "x-shopify-hmac-sha256";
/// Header carrying the topic
pub const HEADER_TOPIC: &str = "x-shopify-topic";
/// Header carrying the shop domain
pub const HEADER_SHOP_DOMAIN: &str = "x-shopify-shop-domain";
/// Header carrying the provider's delivery id
pub const HEADER_WEBHOOK_ID: &str = "x-shopify-webhook-id";
/// Header carrying when the provider emitted the event
pub const HEADER_TRIGGERED_AT: &str = "x-shopify-triggered-at";

/// Outcome of a signature check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    /// Signature matches one of the configured secrets
    Valid,
    /// Missing, malformed, or mismatched signature
    Invalid,
}

impl SignatureCheck {
    /// Check if the signature is valid
    pub fn is_valid(&self) -> bool {
        matches!(self, SignatureCheck::Valid)
    }
}

/// HMAC-SHA256 signature verifier with optional rotation secret
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
    previous_secret: Option<Vec<u8>>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("rotation", &self.previous_secret.is_some())
            .finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    /// Create a verifier for a single secret
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            previous_secret: None,
        }
    }

    /// Also accept signatures made with the previous secret
    pub fn with_previous_secret(mut self, secret: impl AsRef<[u8]>) -> Self {
        self.previous_secret = Some(secret.as_ref().to_vec());
        self
    }

    /// Verify a signature header against the raw body.
    ///
    /// Never fails: any malformed header is simply `Invalid`.
    pub fn verify(&self, body: &[u8], header: Option<&str>) -> SignatureCheck {
        let Some(header) = header.map(str::trim).filter(|h| !h.is_empty()) else {
            return SignatureCheck::Invalid;
        };

        let Ok(claimed) = STANDARD.decode(header) else {
            return SignatureCheck::Invalid;
        };

        if verify_with(&self.secret, body, &claimed) {
            return SignatureCheck::Valid;
        }

        match &self.previous_secret {
            Some(previous) if verify_with(previous, body, &claimed) => {
                tracing::debug!("Webhook signature matched previous secret");
                SignatureCheck::Valid
            }
            _ => SignatureCheck::Invalid,
        }
    }

    /// Compute the header value for a body with the current secret
    pub fn sign(&self, body: &[u8]) -> String {
        sign_with(&self.secret, body)
    }
}

/// Compute a base64 HMAC-SHA256 signature
pub fn sign_with(secret: &[u8], body: &[u8]) -> String {
    // HMAC accepts keys of any length, so this cannot fail
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Constant-time comparison happens inside `verify_slice`
fn verify_with(secret: &[u8], body: &[u8], claimed: &[u8]) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(claimed).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"id":820982911946154508,"email":"jon@example.com"}"#;

    #[test]
    fn test_valid_signature() {
        let verifier = SignatureVerifier::new("hush");
        let header = verifier.sign(BODY);
        assert_eq!(verifier.verify(BODY, Some(&header)), SignatureCheck::Valid);
    }

    #[test]
    fn test_tampered_body_rejected() {
        let verifier = SignatureVerifier::new("hush");
        let header = verifier.sign(BODY);
        let tampered = br#"{"id":820982911946154508,"email":"eve@example.com"}"#;
        assert_eq!(
            verifier.verify(tampered, Some(&header)),
            SignatureCheck::Invalid
        );
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let header = sign_with(b"other", BODY);
        let verifier = SignatureVerifier::new("hush");
        assert!(!verifier.verify(BODY, Some(&header)).is_valid());
    }

    #[test]
    fn test_malformed_headers_are_invalid() {
        let verifier = SignatureVerifier::new("hush");
        assert!(!verifier.verify(BODY, None).is_valid());
        assert!(!verifier.verify(BODY, Some("")).is_valid());
        assert!(!verifier.verify(BODY, Some("   ")).is_valid());
        assert!(!verifier.verify(BODY, Some("not-base64!!")).is_valid());
        // Valid base64, wrong length
        assert!(!verifier.verify(BODY, Some("AAAA")).is_valid());
    }

    #[test]
    fn test_rotation_secret_accepted() {
        let header = sign_with(b"old-secret", BODY);

        let without_rotation = SignatureVerifier::new("new-secret");
        assert!(!without_rotation.verify(BODY, Some(&header)).is_valid());

        let with_rotation = SignatureVerifier::new("new-secret").with_previous_secret("old-secret");
        assert!(with_rotation.verify(BODY, Some(&header)).is_valid());
    }

    #[test]
    fn test_known_vector() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        let header = sign_with(b"key", b"The quick brown fox jumps over the lazy dog");
        assert_eq!(header, "97yD9DBThCSxMpjmqm+xQ+9NWaFJRhdZl0edvC0aPNg=");
    }

    #[test]
    fn test_debug_hides_secret() {
        let verifier = SignatureVerifier::new("super-secret-value");
        assert!(!format!("{:?}", verifier).contains("super-secret-value"));
    }
}
