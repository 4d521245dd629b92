//! HMAC-SHA256 payload signing.
//!
//! Signatures cover the canonical JSON of `{event, data, timestamp}`. Object
//! keys inside `data` serialize in sorted order, so equal payload content
//! always produces an equal signature. The wire format is `v1=<hex>`.

use std::fmt;

use courier_core::models::WebhookPayload;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{DeliveryError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Prefix of every signature this crate produces.
pub const SIGNATURE_PREFIX: &str = "v1=";

/// Signature verification errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// Missing signature.
    MissingSignature,
    /// Signature is not `v1=<hex>`.
    InvalidFormat(String),
    /// Signature verification failed.
    VerificationFailed,
    /// Invalid secret key.
    InvalidSecret,
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSignature => write!(f, "signature missing"),
            Self::InvalidFormat(format) => write!(f, "invalid signature format: {format}"),
            Self::VerificationFailed => write!(f, "signature verification failed"),
            Self::InvalidSecret => write!(f, "invalid secret key"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Bytes covered by the signature.
///
/// # Errors
///
/// Returns `SerializationError` if the payload cannot be encoded.
pub fn canonical_bytes(payload: &WebhookPayload) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

/// Signs `payload` with `secret`, returning `v1=<hex>`.
///
/// # Errors
///
/// Returns `ConfigurationError` for an empty secret and `SerializationError`
/// if the payload cannot be encoded.
pub fn sign_payload(payload: &WebhookPayload, secret: &str) -> Result<String> {
    if secret.is_empty() {
        return Err(DeliveryError::configuration("signing secret is empty"));
    }
    let bytes = canonical_bytes(payload)?;
    let digest = generate_hmac_hex(&bytes, secret)
        .map_err(|err| DeliveryError::configuration(err.to_string()))?;
    Ok(format!("{SIGNATURE_PREFIX}{digest}"))
}

/// Signs when a non-empty secret is configured.
///
/// # Errors
///
/// Returns `SerializationError` if the payload cannot be encoded.
pub fn sign_optional(payload: &WebhookPayload, secret: Option<&str>) -> Result<Option<String>> {
    match secret {
        Some(secret) if !secret.is_empty() => sign_payload(payload, secret).map(Some),
        _ => Ok(None),
    }
}

/// Verifies a `v1=<hex>` signature in constant time.
///
/// # Errors
///
/// Returns the reason verification failed.
pub fn verify_signature(
    payload: &WebhookPayload,
    signature: &str,
    secret: &str,
) -> std::result::Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::MissingSignature);
    }
    if secret.is_empty() {
        return Err(SignatureError::InvalidSecret);
    }

    let provided = signature
        .strip_prefix(SIGNATURE_PREFIX)
        .filter(|hex| hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| SignatureError::InvalidFormat(signature.to_string()))?;

    let bytes = canonical_bytes(payload).map_err(|_| SignatureError::VerificationFailed)?;
    let expected = generate_hmac_hex(&bytes, secret)?;

    if timing_safe_eq(&provided.to_ascii_lowercase(), &expected) {
        Ok(())
    } else {
        Err(SignatureError::VerificationFailed)
    }
}

/// Generates HMAC-SHA256 signature as a lowercase hex string.
fn generate_hmac_hex(payload: &[u8], secret: &str) -> std::result::Result<String, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidSecret)?;

    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Compares two strings without short-circuiting on the first difference.
fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
