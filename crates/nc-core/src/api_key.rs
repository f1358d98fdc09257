//! API key generation and validation
//!
//! The facade is protected by a single shared secret supplied at startup.
//! Keys are compared through their SHA-256 digests in constant time so the
//! comparison leaks neither content nor length.

use rand::Rng;
use sha2::{Digest, Sha256};

/// Length of a generated key in bytes (before hex encoding)
const KEY_BYTES: usize = 32;

/// Generate a new random API key.
///
/// Returns a 64-character hex string (32 random bytes).
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; KEY_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Check a presented key against the configured key
pub fn validate_api_key(provided: &str, expected: &str) -> bool {
    let provided = Sha256::digest(provided.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());

    let mut result = 0u8;
    for (a, b) in provided.iter().zip(expected.iter()) {
        result |= a ^ b;
    }
    result == 0
}
