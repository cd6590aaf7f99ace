//! HMAC-SHA256 payload signing.
//!
//! Used by the webhook delivery layer to compute the
//! `X-Webhook-Signature` header so subscribers can verify that a payload
//! was produced by the catalog.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute an HMAC-SHA256 hex digest of `payload` keyed with `secret`.
pub fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    let digest = mac.finalize().into_bytes();
    format!("{digest:x}")
}
