//! Mempool
//!
//! Validated transactions waiting for a block, ordered by fee rate
//! with arrival time as the tiebreaker. Admission locks the inputs a
//! transaction spends; a conflicting spend is rejected unless it
//! qualifies as a replace-by-fee upgrade. Transactions whose inputs are
//! not yet known are buffered as orphans and retried after each block.

use std::collections::HashMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::config::ConsensusParams;
use crate::crypto::keys::Address;
use crate::error::{CoreError, CoreResult};
use crate::tx::{validate_transaction, OutPoint, Transaction, TxId};
use crate::utxo::UtxoSet;

/// Fee-rate precision: thousandths of a base unit per byte.
const FEE_RATE_SCALE: u64 = 1_000;

/// Fallback fee rate quoted when the pool is empty.
const DEFAULT_FEE_RATE: u64 = FEE_RATE_SCALE;

/// Outcome of a submission that did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    /// Admitted to the pool and inputs locked.
    Accepted,
    /// Inputs unknown; buffered pending a parent transaction.
    Orphaned,
}

/// A pooled transaction with its scoring metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub arrival: u64,
    /// Thousandths of a base unit per byte.
    pub fee_rate: u64,
    pub size_bytes: usize,
    /// Outpoints this entry holds locks on.
    pub locked: Vec<OutPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrphanTx {
    tx: Transaction,
    buffered_at: u64,
}

/// Derived congestion bands reported in the overview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PressureState {
    Normal,
    Moderate,
    Elevated,
    Critical,
}

/// Fee-rate quotes in thousandths of a base unit per byte.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeTiers {
    pub slow: u64,
    pub standard: u64,
    pub priority: u64,
}

/// Snapshot of pool health for operators and fee estimation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MempoolOverview {
    pub pending_count: usize,
    pub total_bytes: usize,
    pub min_fee_rate: u64,
    pub median_fee_rate: u64,
    pub avg_fee_rate: u64,
    pub max_fee_rate: u64,
    pub oldest_age_secs: u64,
    pub tiers: FeeTiers,
    pub pressure: PressureState,
    /// Highest-paying entries, newest view first, capped by the caller.
    pub top: Vec<(String, u64)>,
}

/// The pending-transaction pool.
#[derive(Debug, Default)]
pub struct Mempool {
    entries: HashMap<TxId, MempoolEntry>,
    orphans: Vec<OrphanTx>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn contains(&self, txid: &TxId) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &TxId) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn total_bytes(&self) -> usize {
        self.entries.values().map(|e| e.size_bytes).sum()
    }

    /// Validate and admit a transaction, locking its inputs.
    ///
    /// A transaction spending an outpoint locked by another pending
    /// transaction is admitted only through the replace-by-fee gate;
    /// otherwise it is a double spend. Unknown inputs buffer the
    /// transaction as an orphan instead of rejecting it.
    pub fn add(
        &mut self,
        tx: Transaction,
        utxos: &mut UtxoSet,
        expected_nonce: u64,
        now: u64,
        params: &ConsensusParams,
    ) -> CoreResult<TxOutcome> {
        if self.entries.contains_key(&tx.txid) {
            return Err(CoreError::InvalidStructure("already in mempool".into()));
        }
        if tx.is_coinbase() {
            return Err(CoreError::InvalidStructure(
                "coinbase cannot enter the mempool".into(),
            ));
        }

        match validate_transaction(&tx, utxos, expected_nonce, now, params) {
            Ok(()) => {}
            Err(CoreError::UtxoNotFound(_)) => {
                debug!("buffering orphan transaction {}", tx.txid_hex());
                self.orphans.push(OrphanTx {
                    tx,
                    buffered_at: now,
                });
                return Ok(TxOutcome::Orphaned);
            }
            Err(err) => return Err(err),
        }

        let outpoints: Vec<OutPoint> = tx.inputs.iter().map(|i| i.outpoint()).collect();
        let conflicts = self.conflicting_entries(&outpoints, utxos);

        // A pending transaction from the same sender with the same
        // nonce is a conflict even when it spends different inputs.
        // Entries about to be replaced by fee are exempt, since a
        // replacement legitimately reuses its predecessor's nonce.
        if self.entries.values().any(|e| {
            !conflicts.contains(&e.tx.txid) && e.tx.sender == tx.sender && e.tx.nonce == tx.nonce
        }) {
            return Err(CoreError::NonceViolation {
                got: tx.nonce,
                expected: tx.nonce + 1,
            });
        }

        // Conflicting locks route through replace-by-fee.
        if !conflicts.is_empty() {
            self.apply_rbf(&tx, &conflicts, utxos, params)?;
        }

        utxos.lock(&outpoints, tx.txid)?;

        let size_bytes = tx.size_bytes();
        let entry = MempoolEntry {
            fee_rate: fee_rate(tx.fee, size_bytes),
            size_bytes,
            arrival: now,
            locked: outpoints,
            tx,
        };
        let txid = entry.tx.txid;
        self.entries.insert(txid, entry);
        self.enforce_caps(utxos, params);

        if self.entries.contains_key(&txid) {
            Ok(TxOutcome::Accepted)
        } else {
            // Rank eviction removed the newcomer straight away.
            Err(CoreError::InvalidStructure("mempool full".into()))
        }
    }

    fn conflicting_entries(&self, outpoints: &[OutPoint], utxos: &UtxoSet) -> Vec<TxId> {
        let mut conflicts: Vec<TxId> = Vec::new();
        for outpoint in outpoints {
            if let Some(owner) = utxos.lock_owner(outpoint) {
                if !conflicts.contains(&owner) {
                    conflicts.push(owner);
                }
            }
        }
        conflicts
    }

    fn apply_rbf(
        &mut self,
        replacement: &Transaction,
        conflicts: &[TxId],
        utxos: &mut UtxoSet,
        params: &ConsensusParams,
    ) -> CoreResult<()> {
        let new_rate = fee_rate(replacement.fee, replacement.size_bytes());
        for txid in conflicts {
            let entry = self.entries.get(txid).ok_or_else(|| {
                CoreError::DoubleSpend(format!(
                    "input locked by unknown transaction {}",
                    hex::encode(txid)
                ))
            })?;
            if !entry.tx.rbf_enabled {
                return Err(CoreError::DoubleSpend(format!(
                    "conflicting transaction {} did not opt in to replacement",
                    hex::encode(txid)
                )));
            }
            // 10% fee-rate floor, in integers.
            if new_rate * 10 < entry.fee_rate * 11 {
                return Err(CoreError::DoubleSpend(format!(
                    "replacement fee rate {new_rate} below {} + 10%",
                    entry.fee_rate
                )));
            }
            let min_fee = entry.tx.fee.checked_add(params.min_relay_increment)?;
            if replacement.fee < min_fee {
                return Err(CoreError::DoubleSpend(format!(
                    "replacement fee {} below required {min_fee}",
                    replacement.fee
                )));
            }
        }
        // Every conflict passed the gate; drop them and free the locks.
        for txid in conflicts {
            info!(
                "replacing transaction {} by fee with {}",
                hex::encode(txid),
                replacement.txid_hex()
            );
            self.remove(txid, utxos);
        }
        Ok(())
    }

    /// Drop an entry and release its input locks.
    pub fn remove(&mut self, txid: &TxId, utxos: &mut UtxoSet) -> Option<Transaction> {
        let entry = self.entries.remove(txid)?;
        utxos.release_for_tx(txid);
        Some(entry.tx)
    }

    /// Drop entries that a new block confirmed. Their locks were
    /// already cleared when the block consumed the outpoints.
    pub fn evict_included(&mut self, txids: impl IntoIterator<Item = TxId>) {
        for txid in txids {
            self.entries.remove(&txid);
        }
    }

    /// Greedy highest-fee-rate packing under byte and sigop budgets.
    ///
    /// Each input counts as one signature operation.
    pub fn select_for_block(&self, budget_bytes: usize, budget_sigops: usize) -> Vec<Transaction> {
        let mut ranked = self.ranked();
        ranked.retain(|e| e.size_bytes <= budget_bytes);
        let mut bytes = 0usize;
        let mut sigops = 0usize;
        let mut selected = Vec::new();
        for entry in ranked {
            let cost = entry.tx.inputs.len();
            if bytes + entry.size_bytes > budget_bytes || sigops + cost > budget_sigops {
                continue;
            }
            bytes += entry.size_bytes;
            sigops += cost;
            selected.push(entry.tx.clone());
        }
        selected
    }

    /// Entries sorted by (fee rate desc, arrival asc).
    fn ranked(&self) -> Vec<&MempoolEntry> {
        let mut entries: Vec<&MempoolEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            b.fee_rate
                .cmp(&a.fee_rate)
                .then(a.arrival.cmp(&b.arrival))
        });
        entries
    }

    fn enforce_caps(&mut self, utxos: &mut UtxoSet, params: &ConsensusParams) {
        while self.entries.len() > params.mempool_max_txs
            || self.total_bytes() > params.mempool_max_bytes
        {
            let Some(lowest) = self
                .ranked()
                .last()
                .map(|e| e.tx.txid)
            else {
                break;
            };
            debug!("evicting {} by rank", hex::encode(lowest));
            self.remove(&lowest, utxos);
        }
    }

    /// Pool statistics, tiers, and pressure for `overview` queries.
    pub fn overview(&self, limit: usize, now: u64, params: &ConsensusParams) -> MempoolOverview {
        let ranked = self.ranked();
        let mut rates: Vec<u64> = ranked.iter().map(|e| e.fee_rate).collect();
        rates.sort_unstable();

        let (min, max) = (
            rates.first().copied().unwrap_or(0),
            rates.last().copied().unwrap_or(0),
        );
        let median = if rates.is_empty() {
            0
        } else {
            rates[rates.len() / 2]
        };
        let avg = if rates.is_empty() {
            0
        } else {
            rates.iter().sum::<u64>() / rates.len() as u64
        };
        let oldest_age = ranked
            .iter()
            .map(|e| now.saturating_sub(e.arrival))
            .max()
            .unwrap_or(0);

        let quoted_median = if median == 0 { DEFAULT_FEE_RATE } else { median };
        let tiers = FeeTiers {
            slow: quoted_median * 750 / 1_000,
            standard: quoted_median,
            priority: quoted_median * 1_250 / 1_000,
        };

        let total_bytes = self.total_bytes();
        // Ratios in per-mille; pressure takes the worst of capacity and age.
        let count_ratio = self.entries.len() as u64 * 1_000 / params.mempool_max_txs as u64;
        let bytes_ratio = total_bytes as u64 * 1_000 / params.mempool_max_bytes as u64;
        let age_ratio = oldest_age * 1_000 / params.mempool_max_age_secs.max(1);
        let worst = count_ratio.max(bytes_ratio).max(age_ratio);
        let pressure = match worst {
            0..=499 => PressureState::Normal,
            500..=699 => PressureState::Moderate,
            700..=899 => PressureState::Elevated,
            _ => PressureState::Critical,
        };

        MempoolOverview {
            pending_count: self.entries.len(),
            total_bytes,
            min_fee_rate: min,
            median_fee_rate: median,
            avg_fee_rate: avg,
            max_fee_rate: max,
            oldest_age_secs: oldest_age,
            tiers,
            pressure,
            top: ranked
                .iter()
                .take(limit)
                .map(|e| (e.tx.txid_hex(), e.fee_rate))
                .collect(),
        }
    }

    /// Fee for a transaction of `size_bytes` at the standard tier.
    pub fn estimate_fee(&self, size_bytes: usize, now: u64, params: &ConsensusParams) -> Amount {
        let tiers = self.overview(0, now, params).tiers;
        let units = tiers.standard * size_bytes as u64 / FEE_RATE_SCALE;
        Amount::from_base_units(units.max(1).min(crate::amount::MAX_SUPPLY)).unwrap_or(Amount::ZERO)
    }

    /// Retry buffered orphans after chain state changed; admitted ids
    /// are returned. Stale orphans past their TTL are dropped.
    pub fn retry_orphans(
        &mut self,
        utxos: &mut UtxoSet,
        expected_nonce_of: impl Fn(&Address) -> u64,
        now: u64,
        params: &ConsensusParams,
    ) -> Vec<TxId> {
        let pending = std::mem::take(&mut self.orphans);
        let mut admitted = Vec::new();
        for orphan in pending {
            if now.saturating_sub(orphan.buffered_at) > params.orphan_tx_ttl_secs {
                debug!("dropping expired orphan {}", orphan.tx.txid_hex());
                continue;
            }
            let txid = orphan.tx.txid;
            let expected = expected_nonce_of(&orphan.tx.sender);
            match self.add(orphan.tx, utxos, expected, now, params) {
                Ok(TxOutcome::Accepted) => {
                    info!("orphan transaction {} joined the mempool", hex::encode(txid));
                    admitted.push(txid);
                }
                Ok(TxOutcome::Orphaned) => {}
                Err(_) => {}
            }
        }
        admitted
    }

    /// All pending transactions, for persistence at shutdown.
    pub fn snapshot(&self) -> Vec<Transaction> {
        self.ranked().into_iter().map(|e| e.tx.clone()).collect()
    }

    /// Drop everything, releasing every lock this pool holds.
    pub fn clear(&mut self, utxos: &mut UtxoSet) {
        let txids: Vec<TxId> = self.entries.keys().copied().collect();
        for txid in txids {
            self.remove(&txid, utxos);
        }
        self.orphans.clear();
    }
}

fn fee_rate(fee: Amount, size_bytes: usize) -> u64 {
    fee.base_units()
        .saturating_mul(FEE_RATE_SCALE)
        / size_bytes.max(1) as u64
}
