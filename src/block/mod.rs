//! Blocks and proof of work

pub mod header;
pub mod pow;
pub mod validation;

pub use header::{BlockHash, BlockHeader, HEADER_VERSION};
pub use validation::{validate_block, BlockContext};

use serde::{Deserialize, Serialize};

use crate::merkle::merkle_root;
use crate::tx::Transaction;

/// A full block: header plus ordered transactions, coinbase first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Block {
        Block {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    /// Merkle root over the block's transaction ids.
    pub fn compute_merkle_root(&self) -> [u8; 32] {
        let txids: Vec<[u8; 32]> = self.transactions.iter().map(|tx| tx.txid).collect();
        merkle_root(&txids)
    }

    /// Canonical wire size, the quantity block limits are stated in.
    pub fn size_bytes(&self) -> usize {
        let header = self.header.canonical_bytes().len();
        let body: usize = self.transactions.iter().map(|tx| tx.size_bytes()).sum();
        header + body
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }
}
