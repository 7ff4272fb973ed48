//! HMAC-SHA-256 request signing for outbound webhook deliveries.
//!
//! Mirrors the shape of a keyed-crypto module: a trait for the operation
//! plus a concrete implementation, so the delivery engine can be tested
//! against a fixed key without going through HTTP.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{DispatchError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies outbound request bodies. Each subscription supplies
/// its own key (the subscription `secret`); there is no shared key
/// registry — rotation is handled by `SubscriptionStore::regenerate_secret`
/// replacing the stored secret outright.
pub trait Signer: Send + Sync {
    fn sign(&self, body: &[u8], secret: &str) -> Result<String>;
    fn verify(&self, body: &[u8], signature: &str, secret: &str) -> Result<bool>;
}

/// HMAC-SHA-256 signer producing the `sha256=<hex>` header value format
/// specified in §4.3.
#[derive(Debug, Default, Clone, Copy)]
pub struct HmacSigner;

impl Signer for HmacSigner {
    fn sign(&self, body: &[u8], secret: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| DispatchError::InvalidInput(format!("invalid signing key: {e}")))?;
        mac.update(body);
        let digest = mac.finalize().into_bytes();
        Ok(format!("sha256={}", hex::encode(digest)))
    }

    fn verify(&self, body: &[u8], signature: &str, secret: &str) -> Result<bool> {
        let expected = self.sign(body, secret)?;
        Ok(constant_time_eq(expected.as_bytes(), signature.as_bytes()))
    }
}

/// Constant-time comparison so signature verification does not leak timing
/// information about how many leading bytes matched.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_succeeds_for_matching_key() {
        let signer = HmacSigner;
        let body = br#"{"event":"link.created"}"#;
        let secret = "a".repeat(32);
        let sig = signer.sign(body, &secret).unwrap();
        assert!(sig.starts_with("sha256="));
        assert!(signer.verify(body, &sig, &secret).unwrap());
    }

    #[test]
    fn verify_fails_for_mismatched_key() {
        let signer = HmacSigner;
        let body = br#"{"event":"link.created"}"#;
        let sig = signer.sign(body, &"a".repeat(32)).unwrap();
        assert!(!signer.verify(body, &sig, &"b".repeat(32)).unwrap());
    }

    #[test]
    fn verify_fails_when_body_changes() {
        let signer = HmacSigner;
        let secret = "a".repeat(32);
        let sig = signer.sign(b"original", &secret).unwrap();
        assert!(!signer.verify(b"tampered", &sig, &secret).unwrap());
    }

    #[test]
    fn signature_is_deterministic() {
        let signer = HmacSigner;
        let body = b"same body";
        let secret = "c".repeat(32);
        assert_eq!(signer.sign(body, &secret).unwrap(), signer.sign(body, &secret).unwrap());
    }
}
