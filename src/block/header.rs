//! Block headers
//!
//! The header commits to the parent, the transaction set, and the
//! proof-of-work solution. Its hash is SHA-256 over the canonical
//! header layout.

use serde::{Deserialize, Serialize};

use crate::canonical::CanonicalWriter;
use crate::crypto::sha256;

/// Current header version.
pub const HEADER_VERSION: u32 = 1;

/// Hash of a canonical block header.
pub type BlockHash = [u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Height of the block this header seals.
    pub index: u64,
    pub previous_hash: BlockHash,
    pub merkle_root: [u8; 32],
    pub timestamp: u64,
    /// Positive integer difficulty; the target is 2^256 divided by it.
    pub difficulty: u64,
    pub nonce: u64,
    pub version: u32,
}

impl BlockHeader {
    /// Canonical byte layout hashed for both PoW and identity.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut w = CanonicalWriter::with_capacity(100);
        w.put_u64(self.index)
            .put_fixed(&self.previous_hash)
            .put_fixed(&self.merkle_root)
            .put_u64(self.timestamp)
            .put_u64(self.difficulty)
            .put_u64(self.nonce)
            .put_u32(self.version);
        w.into_bytes()
    }

    pub fn hash(&self) -> BlockHash {
        sha256(&self.canonical_bytes())
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> BlockHeader {
        BlockHeader {
            index: 5,
            previous_hash: sha256(b"parent"),
            merkle_root: sha256(b"merkle"),
            timestamp: 1_700_000_600,
            difficulty: 4,
            nonce: 42,
            version: HEADER_VERSION,
        }
    }

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(header().hash(), header().hash());
    }

    #[test]
    fn test_every_field_feeds_the_hash() {
        let base = header().hash();
        let mut h = header();
        h.nonce += 1;
        assert_ne!(h.hash(), base);
        let mut h = header();
        h.timestamp += 1;
        assert_ne!(h.hash(), base);
        let mut h = header();
        h.difficulty += 1;
        assert_ne!(h.hash(), base);
        let mut h = header();
        h.previous_hash = sha256(b"other parent");
        assert_ne!(h.hash(), base);
    }

    #[test]
    fn test_serde_roundtrip_same_hash() {
        let h = header();
        let bytes = bincode::serialize(&h).unwrap();
        let decoded: BlockHeader = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, h);
        assert_eq!(decoded.hash(), h.hash());
    }
}
