//! HMAC payload signing for webhook deliveries.
//!
//! The signature covers `"<timestamp>.<body bytes>"` with the subscriber's
//! webhook secret; receivers must verify in constant time and reject stale
//! timestamps.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted clock skew between signing and verification, seconds.
pub const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// Sign a payload: `"sha256=" + hex(HMAC-SHA256(secret, "<ts>.<body>"))`.
pub fn sign_payload(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a signature produced by [`sign_payload`].
///
/// Rejects if the timestamp is more than [`TIMESTAMP_TOLERANCE_SECS`] away
/// from `now`, even when the MAC matches.  Comparison is constant-time.
pub fn verify_signature(
    secret: &str,
    timestamp: i64,
    body: &[u8],
    signature: &str,
    now: i64,
) -> bool {
    if (now - timestamp).abs() > TIMESTAMP_TOLERANCE_SECS {
        return false;
    }
    let Some(hex_digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
