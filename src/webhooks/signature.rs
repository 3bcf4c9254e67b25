//! Webhook signature verification using HMAC-SHA256.
//!
//! The reservation platform signs each delivery with a shared secret and sends
//! the result in the `X-Webhook-Signature` header as base64 of the raw
//! HMAC-SHA256 digest. The GitHub-style `sha256=<hex>` form is accepted too.
//!
//! Verification runs over the exact bytes received, before any parsing. When no
//! secret is configured verification is skipped; [`SignatureVerifier`] makes
//! that an explicit branch rather than a fallthrough.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the delivery signature.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Parses a signature header into raw digest bytes.
///
/// Accepts `sha256=<hex>` or bare base64. Returns `None` for anything else.
/// Never panics.
///
/// # Examples
///
/// ```
/// use switchport_webhook::webhooks::parse_signature_header;
///
/// assert_eq!(parse_signature_header("sha256=abcd"), Some(vec![0xab, 0xcd]));
/// assert_eq!(parse_signature_header("q80="), Some(vec![0xab, 0xcd]));
///
/// // Invalid: wrong algorithm prefix, bad hex, bad base64
/// assert!(parse_signature_header("sha1=abcd").is_none());
/// assert!(parse_signature_header("sha256=xyz").is_none());
/// assert!(parse_signature_header("not base64!").is_none());
/// ```
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let header = header.trim();
    if let Some(hex_sig) = header.strip_prefix("sha256=") {
        return hex::decode(hex_sig).ok();
    }
    if header.is_empty() {
        return None;
    }
    BASE64.decode(header).ok()
}

/// Computes the HMAC-SHA256 signature of a payload using the given secret.
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Formats a signature the way the platform sends it (base64).
pub fn format_signature_header(signature: &[u8]) -> String {
    BASE64.encode(signature)
}

/// Verifies a signature header against the payload and secret.
///
/// Uses constant-time comparison via the HMAC library.
///
/// # Examples
///
/// ```
/// use switchport_webhook::webhooks::{compute_signature, format_signature_header, verify_signature};
///
/// let payload = br#"{"eventType":"EVENT_END"}"#;
/// let header = format_signature_header(&compute_signature(payload, b"s3cret"));
///
/// assert!(verify_signature(payload, &header, b"s3cret"));
/// assert!(!verify_signature(payload, &header, b"wrong"));
/// ```
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    let expected_signature = match parse_signature_header(signature_header) {
        Some(sig) => sig,
        None => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);

    mac.verify_slice(&expected_signature).is_ok()
}

/// Why a delivery was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing X-Webhook-Signature header")]
    MissingSignature,

    #[error("invalid webhook signature")]
    InvalidSignature,
}

/// Outcome of a successful check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    /// The header matched the HMAC of the body.
    Verified,
    /// No secret is configured, so nothing was checked.
    Skipped,
}

/// Verifies deliveries against an optional shared secret.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Option<Vec<u8>>,
}

impl SignatureVerifier {
    /// Creates a verifier. An empty secret is treated as no secret.
    pub fn new(secret: Option<impl Into<Vec<u8>>>) -> Self {
        let secret = secret.map(Into::into).filter(|s: &Vec<u8>| !s.is_empty());
        SignatureVerifier { secret }
    }

    /// Creates a verifier that accepts everything.
    pub fn disabled() -> Self {
        SignatureVerifier { secret: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Returns the secret, if any. Used to sign outbound notifications.
    pub fn secret(&self) -> Option<&[u8]> {
        self.secret.as_deref()
    }

    /// Checks a delivery.
    ///
    /// * no secret configured: `Ok(Skipped)`, logged at warn
    /// * secret configured, header missing: `Err(MissingSignature)`
    /// * secret configured, header wrong: `Err(InvalidSignature)`
    pub fn check(&self, body: &[u8], header: Option<&str>) -> Result<SignatureCheck, AuthError> {
        let Some(secret) = &self.secret else {
            warn!("WEBHOOK_SECRET not configured, skipping signature verification");
            return Ok(SignatureCheck::Skipped);
        };

        let Some(header) = header else {
            warn!("Missing webhook signature header");
            return Err(AuthError::MissingSignature);
        };

        if verify_signature(body, header, secret) {
            debug!("Webhook signature verified");
            Ok(SignatureCheck::Verified)
        } else {
            warn!("Webhook signature verification failed");
            Err(AuthError::InvalidSignature)
        }
    }
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
