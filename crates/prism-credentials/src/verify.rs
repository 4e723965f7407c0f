//! Timing-safe verification of client keys.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Compare a presented client key against the configured one.
///
/// Both sides are reduced to SHA-256 digests first, so the comparison always
/// covers exactly 32 bytes regardless of key lengths, and the digest
/// comparison itself is constant-time.
pub fn client_key_matches(presented: &str, expected: &str) -> bool {
    let presented = Sha256::digest(presented.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    presented.as_slice().ct_eq(expected.as_slice()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_exact_match_only() {
        assert!(client_key_matches("ck-secret-1", "ck-secret-1"));
        assert!(!client_key_matches("ck-secret-2", "ck-secret-1"));
        assert!(!client_key_matches("", "ck-secret-1"));
        // same length, one byte off
        assert!(!client_key_matches("ck-secret-0", "ck-secret-1"));
        // prefix of the real key
        assert!(!client_key_matches("ck-secret", "ck-secret-1"));
    }
}
