//! Address transaction index
//!
//! Durable RocksDB index answering "which transactions touched this
//! address" in O(log n), newest block first. Two column families: the
//! query CF keyed by (address, inverted block height, tx position) and
//! a mirror CF keyed by height so reorganization rollbacks delete
//! exactly the affected rows instead of scanning.

use std::path::Path;

use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::crypto::keys::Address;
use crate::error::{CoreError, CoreResult};
use crate::tx::Transaction;

mod cf_names {
    pub const HISTORY: &str = "cf_history";
    pub const BY_BLOCK: &str = "cf_by_block";
}

/// One indexed row of an address's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub block_index: u64,
    pub tx_index: u32,
    pub txid: [u8; 32],
    pub is_sender: bool,
    pub amount_base_units: u64,
    pub timestamp: u64,
}

/// Ordered key-value index over (address, block desc, tx asc).
pub struct AddressIndex {
    db: DB,
}

impl AddressIndex {
    /// Open or create the index at `path`.
    pub fn open(path: &Path) -> CoreResult<AddressIndex> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cfs = vec![
            ColumnFamilyDescriptor::new(cf_names::HISTORY, Options::default()),
            ColumnFamilyDescriptor::new(cf_names::BY_BLOCK, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&opts, path, cfs).map_err(|e| {
            CoreError::StorageError(format!("opening address index at {}: {e}", path.display()))
        })?;
        Ok(AddressIndex { db })
    }

    /// Index one transaction's address touches atomically.
    ///
    /// The sender gets an outgoing row; every distinct output address
    /// gets an incoming row with its received total.
    pub fn index_transaction(
        &self,
        tx: &Transaction,
        block_index: u64,
        tx_index: u32,
        timestamp: u64,
    ) -> CoreResult<()> {
        let mut batch = WriteBatch::default();
        if !tx.sender.is_coinbase() {
            self.stage_entry(
                &mut batch,
                &tx.sender,
                HistoryEntry {
                    block_index,
                    tx_index,
                    txid: tx.txid,
                    is_sender: true,
                    amount_base_units: tx.amount.base_units(),
                    timestamp,
                },
            )?;
        }

        let mut received: Vec<(&Address, u64)> = Vec::new();
        for output in &tx.outputs {
            match received.iter_mut().find(|(addr, _)| *addr == &output.address) {
                Some((_, total)) => *total += output.amount.base_units(),
                None => received.push((&output.address, output.amount.base_units())),
            }
        }
        for (address, total) in received {
            self.stage_entry(
                &mut batch,
                address,
                HistoryEntry {
                    block_index,
                    tx_index,
                    txid: tx.txid,
                    is_sender: false,
                    amount_base_units: total,
                    timestamp,
                },
            )?;
        }

        self.db
            .write(batch)
            .map_err(|e| CoreError::StorageError(e.to_string()))
    }

    fn stage_entry(
        &self,
        batch: &mut WriteBatch,
        address: &Address,
        entry: HistoryEntry,
    ) -> CoreResult<()> {
        let history = self
            .db
            .cf_handle(cf_names::HISTORY)
            .ok_or_else(|| CoreError::StorageError("missing history cf".into()))?;
        let by_block = self
            .db
            .cf_handle(cf_names::BY_BLOCK)
            .ok_or_else(|| CoreError::StorageError("missing by-block cf".into()))?;

        let value =
            bincode::serialize(&entry).map_err(|e| CoreError::StorageError(e.to_string()))?;
        batch.put_cf(
            history,
            history_key(address, entry.block_index, entry.tx_index, entry.is_sender),
            value,
        );
        batch.put_cf(
            by_block,
            by_block_key(entry.block_index, entry.tx_index, entry.is_sender, address),
            [],
        );
        Ok(())
    }

    /// Paged history for an address, newest block first, plus the total
    /// row count.
    pub fn get_transactions(
        &self,
        address: &Address,
        limit: usize,
        offset: usize,
    ) -> CoreResult<(Vec<HistoryEntry>, usize)> {
        if limit == 0 {
            return Err(CoreError::InvalidStructure("limit must be positive".into()));
        }
        let history = self
            .db
            .cf_handle(cf_names::HISTORY)
            .ok_or_else(|| CoreError::StorageError("missing history cf".into()))?;

        let prefix = address_prefix(address);
        let iter = self.db.iterator_cf(
            history,
            IteratorMode::From(&prefix, Direction::Forward),
        );

        let mut rows = Vec::new();
        let mut total = 0usize;
        for item in iter {
            let (key, value) = item.map_err(|e| CoreError::StorageError(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            if total >= offset && rows.len() < limit {
                let entry: HistoryEntry = bincode::deserialize(&value)
                    .map_err(|e| CoreError::StorageError(e.to_string()))?;
                rows.push(entry);
            }
            total += 1;
        }
        Ok((rows, total))
    }

    /// Number of indexed rows for an address.
    pub fn get_transaction_count(&self, address: &Address) -> CoreResult<usize> {
        // Row counts stay cheap because the prefix scan never leaves
        // the address's key range.
        let history = self
            .db
            .cf_handle(cf_names::HISTORY)
            .ok_or_else(|| CoreError::StorageError("missing history cf".into()))?;
        let prefix = address_prefix(address);
        let iter = self.db.iterator_cf(
            history,
            IteratorMode::From(&prefix, Direction::Forward),
        );
        let mut total = 0usize;
        for item in iter {
            let (key, _) = item.map_err(|e| CoreError::StorageError(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            total += 1;
        }
        Ok(total)
    }

    /// Delete every row above `height`, both column families, in one
    /// write batch. Used when blocks are disconnected.
    pub fn rollback_to_block(&self, height: u64) -> CoreResult<()> {
        let history = self
            .db
            .cf_handle(cf_names::HISTORY)
            .ok_or_else(|| CoreError::StorageError("missing history cf".into()))?;
        let by_block = self
            .db
            .cf_handle(cf_names::BY_BLOCK)
            .ok_or_else(|| CoreError::StorageError("missing by-block cf".into()))?;

        let start = (height + 1).to_be_bytes();
        let iter = self
            .db
            .iterator_cf(by_block, IteratorMode::From(&start, Direction::Forward));

        let mut batch = WriteBatch::default();
        for item in iter {
            let (key, _) = item.map_err(|e| CoreError::StorageError(e.to_string()))?;
            let Some((block_index, tx_index, is_sender, address)) = parse_by_block_key(&key)
            else {
                continue;
            };
            batch.delete_cf(
                history,
                history_key(&address, block_index, tx_index, is_sender),
            );
            batch.delete_cf(by_block, key);
        }
        self.db
            .write(batch)
            .map_err(|e| CoreError::StorageError(e.to_string()))
    }

    /// Wipe and re-index an entire chain. Operator recovery path.
    pub fn rebuild_from_chain(&self, chain: &[Block]) -> CoreResult<()> {
        let history = self
            .db
            .cf_handle(cf_names::HISTORY)
            .ok_or_else(|| CoreError::StorageError("missing history cf".into()))?;
        let by_block = self
            .db
            .cf_handle(cf_names::BY_BLOCK)
            .ok_or_else(|| CoreError::StorageError("missing by-block cf".into()))?;
        let mut batch = WriteBatch::default();
        for cf in [history, by_block] {
            let iter = self.db.iterator_cf(cf, IteratorMode::Start);
            for item in iter {
                let (key, _) = item.map_err(|e| CoreError::StorageError(e.to_string()))?;
                batch.delete_cf(cf, key);
            }
        }
        self.db
            .write(batch)
            .map_err(|e| CoreError::StorageError(e.to_string()))?;

        for block in chain {
            for (tx_index, tx) in block.transactions.iter().enumerate() {
                self.index_transaction(
                    tx,
                    block.header.index,
                    tx_index as u32,
                    block.header.timestamp,
                )?;
            }
        }
        Ok(())
    }
}

fn address_prefix(address: &Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(address.as_str().len() + 1);
    key.extend_from_slice(address.as_str().as_bytes());
    key.push(0);
    key
}

/// Query key: address, NUL, inverted height, tx position, direction
/// flag. Inverting the height makes ascending iteration visit newest
/// blocks first.
fn history_key(address: &Address, block_index: u64, tx_index: u32, is_sender: bool) -> Vec<u8> {
    let mut key = address_prefix(address);
    key.extend_from_slice(&(u64::MAX - block_index).to_be_bytes());
    key.extend_from_slice(&tx_index.to_be_bytes());
    key.push(is_sender as u8);
    key
}

fn by_block_key(block_index: u64, tx_index: u32, is_sender: bool, address: &Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(13 + address.as_str().len());
    key.extend_from_slice(&block_index.to_be_bytes());
    key.extend_from_slice(&tx_index.to_be_bytes());
    key.push(is_sender as u8);
    key.extend_from_slice(address.as_str().as_bytes());
    key
}

fn parse_by_block_key(key: &[u8]) -> Option<(u64, u32, bool, Address)> {
    if key.len() < 14 {
        return None;
    }
    let block_index = u64::from_be_bytes(key[0..8].try_into().ok()?);
    let tx_index = u32::from_be_bytes(key[8..12].try_into().ok()?);
    let is_sender = key[12] != 0;
    let address = Address::from_raw(std::str::from_utf8(&key[13..]).ok()?);
    Some((block_index, tx_index, is_sender, address))
}
