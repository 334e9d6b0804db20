//! HMAC-SHA256 webhook signature verification.
//!
//! The three upstream services sign payloads in slightly different header
//! formats (`sha256=<hex>`, `v1=<hex>`, or bare hex); all reduce to an
//! HMAC-SHA256 over the raw body. Comparison is constant-time.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signature verification failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature header present but empty.
    Empty,
    /// Signature not in a recognized format.
    InvalidFormat(String),
    /// Signature did not match the payload.
    Mismatch,
    /// Secret key rejected by the MAC implementation.
    InvalidSecret,
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "signature header is empty"),
            Self::InvalidFormat(format) => write!(f, "invalid signature format: {format}"),
            Self::Mismatch => write!(f, "signature mismatch"),
            Self::InvalidSecret => write!(f, "invalid secret key"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Verifies a signature header against the raw payload.
pub fn verify_signature(
    payload: &[u8],
    signature: &str,
    secret: &str,
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Empty);
    }

    let provided = parse_signature_format(signature)?;
    let expected = sign_payload(payload, secret)?;

    if timing_safe_eq(&provided, &expected) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Computes the expected HMAC-SHA256 signature as lowercase hex.
pub fn sign_payload(payload: &[u8], secret: &str) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::InvalidSecret)?;

    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Reduces the supported header formats to raw hex.
fn parse_signature_format(signature: &str) -> Result<String, SignatureError> {
    if let Some(hex_part) = signature.strip_prefix("sha256=") {
        return Ok(hex_part.to_string());
    }

    if let Some(hex_part) = signature.strip_prefix("v1=") {
        return Ok(hex_part.to_string());
    }

    if signature.len() == 64 && signature.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(signature.to_string());
    }

    Err(SignatureError::InvalidFormat(format!(
        "expected 'sha256=<hex>', 'v1=<hex>', or raw hex, got: {signature}"
    )))
}

/// Constant-time string comparison.
fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut acc = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        acc |= x ^ y;
    }
    acc == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_signature_verifies() {
        let payload = b"{\"event_id\":\"evt_1\"}";
        let secret = "payment_secret";

        let hex_sig = sign_payload(payload, secret).unwrap();
        assert!(verify_signature(payload, &format!("sha256={hex_sig}"), secret).is_ok());
        assert!(verify_signature(payload, &format!("v1={hex_sig}"), secret).is_ok());
        assert!(verify_signature(payload, &hex_sig, secret).is_ok());
    }

    #[test]
    fn tampered_payload_fails() {
        let secret = "secret";
        let hex_sig = sign_payload(b"original", secret).unwrap();

        let err = verify_signature(b"tampered", &format!("sha256={hex_sig}"), secret).unwrap_err();
        assert_eq!(err, SignatureError::Mismatch);
    }

    #[test]
    fn wrong_secret_fails() {
        let hex_sig = sign_payload(b"payload", "right").unwrap();
        let err = verify_signature(b"payload", &format!("sha256={hex_sig}"), "wrong").unwrap_err();
        assert_eq!(err, SignatureError::Mismatch);
    }

    #[test]
    fn unrecognized_format_rejected() {
        let err = verify_signature(b"payload", "not-a-signature", "secret").unwrap_err();
        assert!(matches!(err, SignatureError::InvalidFormat(_)));
    }

    #[test]
    fn empty_signature_rejected() {
        let err = verify_signature(b"payload", "", "secret").unwrap_err();
        assert_eq!(err, SignatureError::Empty);
    }

    #[test]
    fn signature_is_deterministic_64_hex_chars() {
        let first = sign_payload(b"payload", "secret").unwrap();
        let second = sign_payload(b"payload", "secret").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }
}
