//! Visitor sign keys.
//!
//! A visitor proves it knows a proxy's secret by sending
//! `hex(BLAKE3-keyed(BLAKE3(sk), timestamp))` alongside the timestamp. The
//! server recomputes it and compares in constant time.

use subtle::ConstantTimeEq;

/// Compute the sign key for a secret and unix timestamp
#[must_use]
pub fn sign_key(sk: &str, timestamp: i64) -> String {
    let key = blake3::hash(sk.as_bytes());
    let mac = blake3::keyed_hash(key.as_bytes(), timestamp.to_string().as_bytes());
    hex::encode(mac.as_bytes())
}

/// Constant-time comparison of byte slices.
///
/// Execution time depends only on slice length, not content.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.ct_eq(b).into()
}

/// Check a visitor's sign key against the proxy secret
#[must_use]
pub fn verify_sign_key(sk: &str, timestamp: i64, presented: &str) -> bool {
    ct_eq(sign_key(sk, timestamp).as_bytes(), presented.as_bytes())
}
