//! Orphan block pool
//!
//! Blocks whose parent is not the current tip wait here, keyed by the
//! height at which they would connect. After each accepted block the
//! pool is scanned for children of the new tip; orphan chains that
//! accumulate more work than the canonical tip drive reorganization.

use std::collections::BTreeMap;

use log::debug;

use crate::block::{Block, BlockHash};

/// Buffered out-of-order blocks keyed by expected connect height.
#[derive(Debug, Default)]
pub struct OrphanBlockPool {
    by_height: BTreeMap<u64, Vec<Block>>,
}

impl OrphanBlockPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_height.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_height.is_empty()
    }

    /// Buffer a block unless an identical one is already waiting.
    pub fn insert(&mut self, block: Block) {
        let entry = self.by_height.entry(block.header.index).or_default();
        let hash = block.hash();
        if entry.iter().any(|b| b.hash() == hash) {
            return;
        }
        debug!(
            "buffering orphan block {} at height {}",
            hex::encode(hash),
            block.header.index
        );
        entry.push(block);
    }

    /// Remove and return the block at `height` whose parent is
    /// `previous_hash`, if one is waiting.
    pub fn take_child(&mut self, height: u64, previous_hash: &BlockHash) -> Option<Block> {
        let blocks = self.by_height.get_mut(&height)?;
        let position = blocks
            .iter()
            .position(|b| b.header.previous_hash == *previous_hash)?;
        let block = blocks.remove(position);
        if blocks.is_empty() {
            self.by_height.remove(&height);
        }
        Some(block)
    }

    /// Blocks waiting to connect at `height`.
    pub fn at_height(&self, height: u64) -> &[Block] {
        self.by_height.get(&height).map_or(&[], Vec::as_slice)
    }

    /// Heights with at least one waiting block, ascending.
    pub fn heights(&self) -> Vec<u64> {
        self.by_height.keys().copied().collect()
    }

    /// Greedily extend a chain from `previous_hash` at `height` using
    /// buffered blocks, without removing them.
    pub fn build_chain_from(&self, height: u64, previous_hash: &BlockHash) -> Vec<Block> {
        let mut chain = Vec::new();
        let mut parent = *previous_hash;
        let mut next = height;
        while let Some(block) = self
            .at_height(next)
            .iter()
            .find(|b| b.header.previous_hash == parent)
        {
            parent = block.hash();
            next += 1;
            chain.push(block.clone());
        }
        chain
    }

    /// Forget a specific block, typically after it connected.
    pub fn remove(&mut self, height: u64, hash: &BlockHash) {
        if let Some(blocks) = self.by_height.get_mut(&height) {
            blocks.retain(|b| b.hash() != *hash);
            if blocks.is_empty() {
                self.by_height.remove(&height);
            }
        }
    }

    /// Drop orphans that fell too far below the tip to ever connect.
    pub fn prune_below(&mut self, min_height: u64) {
        let stale: Vec<u64> = self
            .by_height
            .range(..min_height)
            .map(|(h, _)| *h)
            .collect();
        for height in stale {
            let removed = self.by_height.remove(&height).map_or(0, |v| v.len());
            debug!("pruned {removed} orphan blocks at height {height}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use crate::block::{BlockHeader, HEADER_VERSION};
    use crate::crypto::{sha256, KeyPair, Network};
    use crate::merkle::merkle_root;
    use crate::tx::types::TxOutput;
    use crate::tx::Transaction;

    fn block(index: u64, previous_hash: BlockHash) -> Block {
        let miner = KeyPair::generate().address(Network::Mainnet);
        let cb = Transaction::coinbase(
            vec![TxOutput {
                address: miner,
                amount: Amount::from_coins(12).unwrap(),
            }],
            index,
            1_700_000_000 + index,
        );
        let header = BlockHeader {
            index,
            previous_hash,
            merkle_root: merkle_root(&[cb.txid]),
            timestamp: 1_700_000_000 + index,
            difficulty: 1,
            nonce: 0,
            version: HEADER_VERSION,
        };
        Block::new(header, vec![cb])
    }

    #[test]
    fn test_insert_dedupes() {
        let mut pool = OrphanBlockPool::new();
        let b = block(5, sha256(b"parent"));
        pool.insert(b.clone());
        pool.insert(b);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_take_child_matches_parent() {
        let mut pool = OrphanBlockPool::new();
        let parent = sha256(b"parent");
        let child = block(5, parent);
        let unrelated = block(5, sha256(b"other"));
        pool.insert(child.clone());
        pool.insert(unrelated);

        assert!(pool.take_child(5, &sha256(b"missing")).is_none());
        let taken = pool.take_child(5, &parent).unwrap();
        assert_eq!(taken.hash(), child.hash());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_build_chain_walks_links() {
        let mut pool = OrphanBlockPool::new();
        let root = sha256(b"fork-point");
        let a = block(3, root);
        let b = block(4, a.hash());
        let c = block(5, b.hash());
        pool.insert(c.clone());
        pool.insert(a.clone());
        pool.insert(b.clone());
        // A stray sibling must not divert the walk.
        pool.insert(block(4, sha256(b"elsewhere")));

        let chain = pool.build_chain_from(3, &root);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].hash(), a.hash());
        assert_eq!(chain[2].hash(), c.hash());
        // Building leaves the pool intact.
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn test_prune_below() {
        let mut pool = OrphanBlockPool::new();
        for height in [10u64, 50, 120] {
            pool.insert(block(height, sha256(&height.to_be_bytes())));
        }
        pool.prune_below(100);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.heights(), vec![120]);
    }
}
