//! SHA-256 digesting.
//!
//! All digesting in this crate — layer-contract hashing, BatchNorm
//! provenance, and certificate digest/Merkle hashing — goes through this
//! module, backed by the pure-Rust `sha2` crate rather than a
//! platform/system crypto library. There is no XOF or domain-separated
//! absorption protocol here, just "hash these bytes".

use sha2::{Digest, Sha256};

/// A 32-byte SHA-256 digest.
pub type Digest32 = [u8; 32];

/// Hash a single byte slice to a 32-byte SHA-256 digest.
pub fn sha256(bytes: &[u8]) -> Digest32 {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Incrementally hash several byte slices as one logical message, in the
/// order given, equivalent to concatenating them before hashing.
pub fn sha256_concat(parts: &[&[u8]]) -> Digest32 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Format a digest as lowercase hex, for logs and the certificate's
/// human-readable formatter.
pub fn to_hex(digest: &Digest32) -> String {
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_answer_empty_string() {
        assert_eq!(
            to_hex(&sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn known_answer_abc() {
        assert_eq!(
            to_hex(&sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn concat_matches_single_buffer() {
        let whole = sha256(b"hello world");
        let split = sha256_concat(&[b"hello ", b"world"]);
        assert_eq!(whole, split);
    }

    #[test]
    fn order_sensitive() {
        assert_ne!(sha256(b"ab"), sha256(b"ba"));
    }
}
