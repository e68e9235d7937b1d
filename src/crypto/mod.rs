//! Cryptographic primitives
//!
//! Consensus-critical hashing, secp256k1 key handling, and low-S ECDSA
//! signatures. Every hash in consensus paths is SHA-256; every random
//! value that matters for security comes from the OS CSPRNG.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

pub mod keys;
pub mod signatures;

pub use keys::{Address, KeyPair, Network, PublicKeyBytes, ADDRESS_HASH_LEN, COINBASE_SENDER};
pub use signatures::{sign, verify, SIGNATURE_LEN};

/// Cryptographic error types.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Result type for cryptographic operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// SHA-256 of a byte slice.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 over two 32-byte nodes, smaller hash first.
///
/// The lexicographic ordering makes parent hashes independent of which
/// side a child arrived on.
pub fn hash_pair_sorted(a: [u8; 32], b: [u8; 32]) -> [u8; 32] {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(lo);
    hasher.update(hi);
    hasher.finalize().into()
}

/// Cryptographically secure random 32-byte array.
pub fn random_32() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Cryptographically secure random 24 bytes, sized for an XChaCha20
/// nonce.
pub fn random_24() -> [u8; 24] {
    let mut bytes = [0u8; 24];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vectors() {
        // NIST vectors
        assert_eq!(
            hex::encode(sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hash_pair_is_order_independent() {
        let a = sha256(b"a");
        let b = sha256(b"b");
        assert_eq!(hash_pair_sorted(a, b), hash_pair_sorted(b, a));
        assert_ne!(hash_pair_sorted(a, b), hash_pair_sorted(a, a));
    }

    #[test]
    fn test_random_values_distinct() {
        assert_ne!(random_32(), random_32());
        assert_ne!(random_24(), random_24());
    }
}
