//! HMAC-SHA256 payload signing.
//!
//! The signature header value is `sha256=` followed by the lowercase hex HMAC of the
//! exact request body, keyed with the subscription secret:
//!
//! ```text
//! X-Webhook-Signature: sha256=<64 lowercase hex characters>
//! ```
//!
//! Receivers recompute the HMAC over the raw body and compare with [`verify_signature`].

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Prefix of every signature value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Sign a payload.
///
/// Deterministic: the same secret and bytes always yield the same signature.
pub fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(payload);
    let signature = mac.finalize().into_bytes();

    format!("{}{}", SIGNATURE_PREFIX, hex::encode(signature))
}

/// Verify a signature header value against a payload.
///
/// Returns `true` only if `signature` is exactly what [`sign`] produces for these inputs.
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    if !signature.starts_with(SIGNATURE_PREFIX) {
        return false;
    }
    let expected = sign(secret, payload);
    constant_time_eq(signature.as_bytes(), expected.as_bytes())
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        // Well-known HMAC-SHA256 test vector
        let signature = sign("key", b"The quick brown fox jumps over the lazy dog");
        assert_eq!(
            signature,
            "sha256=f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn test_sign_is_deterministic() {
        let payload = br#"{"event":"user.created","data":{"id":1}}"#;
        assert_eq!(sign("whsec", payload), sign("whsec", payload));
    }

    #[test]
    fn test_signature_format() {
        let signature = sign("secret", b"{}");
        let hex_part = signature.strip_prefix(SIGNATURE_PREFIX).expect("prefix");
        assert_eq!(hex_part.len(), 64);
        assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_sign_and_verify() {
        let payload = br#"{"event":"order.created"}"#;
        let signature = sign("s3cret", payload);

        assert!(verify_signature("s3cret", payload, &signature));

        // Wrong payload should fail
        assert!(!verify_signature("s3cret", b"{}", &signature));

        // Wrong secret should fail
        assert!(!verify_signature("other", payload, &signature));
    }

    #[test]
    fn test_verify_invalid_signature_format() {
        assert!(!verify_signature("s", b"{}", "invalid"));
        assert!(!verify_signature("s", b"{}", "sha256="));
        let signature = sign("s", b"{}");
        let without_prefix = signature.trim_start_matches(SIGNATURE_PREFIX);
        assert!(!verify_signature("s", b"{}", without_prefix));
    }

    #[test]
    fn test_empty_secret_still_signs() {
        let signature = sign("", b"payload");
        assert!(signature.starts_with(SIGNATURE_PREFIX));
        assert!(verify_signature("", b"payload", &signature));
    }
}
