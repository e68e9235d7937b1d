//! Durable chain storage
//!
//! Append-only block files named by height, an atomically swapped tip
//! pointer, and a JSON mempool snapshot saved at shutdown. Every write
//! goes to a temporary file first and is renamed into place so readers
//! and crash recovery never see partial data.

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

use crate::block::{Block, BlockHash};
use crate::error::{CoreError, CoreResult};
use crate::tx::Transaction;

/// Filesystem layout under one data directory.
pub struct BlockStore {
    blocks_dir: PathBuf,
    tip_path: PathBuf,
    mempool_path: PathBuf,
}

impl BlockStore {
    /// Open the store rooted at `data_dir`, creating directories as
    /// needed.
    pub fn open(data_dir: &Path) -> CoreResult<BlockStore> {
        let blocks_dir = data_dir.join("blocks");
        fs::create_dir_all(&blocks_dir)?;
        Ok(BlockStore {
            blocks_dir,
            tip_path: data_dir.join("TIP"),
            mempool_path: data_dir.join("mempool.json"),
        })
    }

    /// Persist one block under `blocks/<index>.bin`.
    pub fn save_block(&self, block: &Block) -> CoreResult<()> {
        let bytes =
            bincode::serialize(block).map_err(|e| CoreError::StorageError(e.to_string()))?;
        self.write_atomic(
            &self.blocks_dir.join(format!("{}.bin", block.header.index)),
            &bytes,
        )
    }

    pub fn load_block(&self, index: u64) -> CoreResult<Option<Block>> {
        let path = self.blocks_dir.join(format!("{index}.bin"));
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let block =
            bincode::deserialize(&bytes).map_err(|e| CoreError::StorageError(e.to_string()))?;
        Ok(Some(block))
    }

    /// Remove blocks above `height`, used when a reorg shortens the
    /// persisted chain before the replacement blocks land.
    pub fn truncate_above(&self, height: u64) -> CoreResult<()> {
        for entry in fs::read_dir(&self.blocks_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(index) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".bin"))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            if index > height {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Atomically update the tip pointer.
    pub fn save_tip(&self, hash: &BlockHash) -> CoreResult<()> {
        self.write_atomic(&self.tip_path, hex::encode(hash).as_bytes())
    }

    pub fn load_tip(&self) -> CoreResult<Option<BlockHash>> {
        if !self.tip_path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.tip_path)?;
        let bytes = hex::decode(text.trim())
            .map_err(|e| CoreError::StorageError(format!("corrupt tip pointer: {e}")))?;
        let hash: BlockHash = bytes
            .try_into()
            .map_err(|_| CoreError::StorageError("tip pointer must be 32 bytes".into()))?;
        Ok(Some(hash))
    }

    /// Read blocks 0..n until the first gap.
    pub fn load_chain(&self) -> CoreResult<Vec<Block>> {
        let mut chain = Vec::new();
        let mut index = 0u64;
        while let Some(block) = self.load_block(index)? {
            if block.header.index != index {
                warn!(
                    "block file {index}.bin carries height {}; stopping load",
                    block.header.index
                );
                break;
            }
            chain.push(block);
            index += 1;
        }
        Ok(chain)
    }

    /// Persist the mempool for graceful shutdown.
    pub fn save_mempool(&self, txs: &[Transaction]) -> CoreResult<()> {
        let json =
            serde_json::to_vec(txs).map_err(|e| CoreError::StorageError(e.to_string()))?;
        self.write_atomic(&self.mempool_path, &json)
    }

    /// Load and clear the persisted mempool snapshot, if any.
    pub fn take_mempool(&self) -> CoreResult<Vec<Transaction>> {
        if !self.mempool_path.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&self.mempool_path)?;
        let txs = serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::StorageError(e.to_string()))?;
        fs::remove_file(&self.mempool_path)?;
        Ok(txs)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> CoreResult<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
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
    use tempfile::tempdir;

    fn block(index: u64) -> Block {
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
            previous_hash: sha256(&index.to_be_bytes()),
            merkle_root: merkle_root(&[cb.txid]),
            timestamp: 1_700_000_000 + index,
            difficulty: 1,
            nonce: 0,
            version: HEADER_VERSION,
        };
        Block::new(header, vec![cb])
    }

    #[test]
    fn test_block_roundtrip() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let b = block(3);
        store.save_block(&b).unwrap();

        let loaded = store.load_block(3).unwrap().unwrap();
        assert_eq!(loaded, b);
        assert_eq!(loaded.hash(), b.hash());
        assert!(store.load_block(4).unwrap().is_none());
    }

    #[test]
    fn test_tip_pointer_roundtrip() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        assert!(store.load_tip().unwrap().is_none());

        let hash = sha256(b"tip");
        store.save_tip(&hash).unwrap();
        assert_eq!(store.load_tip().unwrap(), Some(hash));
    }

    #[test]
    fn test_load_chain_stops_at_gap() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        for i in [0u64, 1, 2, 4] {
            store.save_block(&block(i)).unwrap();
        }
        let chain = store.load_chain().unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.last().unwrap().header.index, 2);
    }

    #[test]
    fn test_truncate_above() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        for i in 0..5u64 {
            store.save_block(&block(i)).unwrap();
        }
        store.truncate_above(2).unwrap();
        assert_eq!(store.load_chain().unwrap().len(), 3);
    }

    #[test]
    fn test_mempool_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let txs = vec![block(1).transactions[0].clone()];
        store.save_mempool(&txs).unwrap();

        let loaded = store.take_mempool().unwrap();
        assert_eq!(loaded, txs);
        // The snapshot is consumed on load.
        assert!(store.take_mempool().unwrap().is_empty());
    }
}
