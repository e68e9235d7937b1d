//! Merkle tree construction and inclusion proofs
//!
//! Leaves are the SHA-256 transaction ids. Parent nodes hash their
//! children in lexicographic order, so the tree is deterministic no
//! matter which side a hash arrives on; odd levels duplicate their last
//! node. The empty tree commits to SHA-256 of the empty string.

use serde::{Deserialize, Serialize};

use crate::crypto::{hash_pair_sorted, sha256};

/// Which side of the pair the sibling sat on in tree geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Position {
    Left,
    Right,
}

/// One step of an inclusion proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: [u8; 32],
    pub position: Position,
}

/// Inclusion proof from a leaf up to, but excluding, the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub steps: Vec<ProofStep>,
}

impl MerkleProof {
    /// Fold the leaf hash with each sibling; the result must equal the
    /// claimed root. Pair hashing sorts its operands exactly like
    /// construction does, so a proof built for one geometry verifies
    /// regardless of sibling side.
    pub fn verify(&self, leaf: [u8; 32], root: [u8; 32]) -> bool {
        let mut current = leaf;
        for step in &self.steps {
            current = hash_pair_sorted(current, step.sibling);
        }
        current == root
    }
}

/// A fully-built merkle tree retaining every level for proof queries.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<[u8; 32]>>,
}

impl MerkleTree {
    /// Build from pre-hashed leaves (transaction ids).
    pub fn from_leaves(leaves: Vec<[u8; 32]>) -> MerkleTree {
        if leaves.is_empty() {
            return MerkleTree { levels: Vec::new() };
        }
        let mut levels = vec![leaves];
        while levels.last().unwrap().len() > 1 {
            let current = levels.last().unwrap();
            let mut next = Vec::with_capacity((current.len() + 1) / 2);
            for pair in current.chunks(2) {
                let left = pair[0];
                let right = if pair.len() == 2 { pair[1] } else { pair[0] };
                next.push(hash_pair_sorted(left, right));
            }
            levels.push(next);
        }
        MerkleTree { levels }
    }

    /// Root commitment. The empty tree hashes the empty string.
    pub fn root(&self) -> [u8; 32] {
        match self.levels.last() {
            Some(top) => top[0],
            None => sha256(b""),
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    /// Inclusion proof for the leaf at `index`, ordered leaf to root.
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut steps = Vec::new();
        let mut idx = index;
        for level in &self.levels[..self.levels.len().saturating_sub(1)] {
            let is_left = idx % 2 == 0;
            let sibling_idx = if is_left { idx + 1 } else { idx - 1 };
            let (sibling, position) = if sibling_idx < level.len() {
                (
                    level[sibling_idx],
                    if is_left { Position::Right } else { Position::Left },
                )
            } else {
                // Odd tail: the node was paired with a copy of itself.
                (level[idx], Position::Right)
            };
            steps.push(ProofStep { sibling, position });
            idx /= 2;
        }
        Some(MerkleProof { steps })
    }

    /// Proof addressed by leaf hash instead of index.
    pub fn proof_for_leaf(&self, leaf: [u8; 32]) -> Option<MerkleProof> {
        let index = self.levels.first()?.iter().position(|l| *l == leaf)?;
        self.proof(index)
    }
}

/// Root over a transaction id list without keeping the tree.
pub fn merkle_root(txids: &[[u8; 32]]) -> [u8; 32] {
    MerkleTree::from_leaves(txids.to_vec()).root()
}
