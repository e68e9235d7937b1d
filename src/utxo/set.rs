//! UTXO set with transaction-scoped locking
//!
//! The set exclusively owns every unspent output. Mempool admission
//! locks the outpoints a transaction spends; locks are released only by
//! transaction-lifecycle events (rejection, replacement, or block
//! inclusion). There is deliberately no lock timeout: expiry would let
//! a still-pending transaction's inputs be re-selected and double
//! spent.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::amount::Amount;
use crate::crypto::keys::Address;
use crate::error::{CoreError, CoreResult};
use crate::tx::{OutPoint, TxId};

/// One unspent output, uniquely identified by its outpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub address: Address,
    pub outpoint: OutPoint,
    pub amount: Amount,
    /// Spend condition; binds the output to the holder of the address.
    pub script_pubkey: String,
    /// Set once consumed. Active entries in the set are always false;
    /// the flag travels on removed values used for reorg undo.
    pub spent: bool,
}

/// The active unspent-output set plus the mempool's input locks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UtxoSet {
    by_outpoint: HashMap<OutPoint, Utxo>,
    by_address: HashMap<Address, BTreeSet<OutPoint>>,
    pending_locks: HashMap<OutPoint, TxId>,
    locks_by_tx: HashMap<TxId, HashSet<OutPoint>>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly created output. A duplicate outpoint means a
    /// validation layer above failed; it is reported, not overwritten.
    pub fn add_utxo(
        &mut self,
        address: Address,
        outpoint: OutPoint,
        amount: Amount,
        script_pubkey: String,
    ) -> CoreResult<()> {
        if self.by_outpoint.contains_key(&outpoint) {
            return Err(CoreError::InvalidStructure(format!(
                "duplicate outpoint {outpoint}"
            )));
        }
        self.by_address
            .entry(address.clone())
            .or_default()
            .insert(outpoint);
        self.by_outpoint.insert(
            outpoint,
            Utxo {
                address,
                outpoint,
                amount,
                script_pubkey,
                spent: false,
            },
        );
        Ok(())
    }

    /// Mark an output spent and drop it from the active set. The
    /// removed value is returned so a reorganization can restore it.
    pub fn consume(&mut self, outpoint: &OutPoint) -> CoreResult<Utxo> {
        let mut utxo = self
            .by_outpoint
            .remove(outpoint)
            .ok_or_else(|| CoreError::UtxoNotFound(outpoint.to_string()))?;
        if let Some(set) = self.by_address.get_mut(&utxo.address) {
            set.remove(outpoint);
            if set.is_empty() {
                self.by_address.remove(&utxo.address);
            }
        }
        // A consumed outpoint can never stay lockable.
        if let Some(owner) = self.pending_locks.remove(outpoint) {
            if let Some(outpoints) = self.locks_by_tx.get_mut(&owner) {
                outpoints.remove(outpoint);
                if outpoints.is_empty() {
                    self.locks_by_tx.remove(&owner);
                }
            }
        }
        utxo.spent = true;
        Ok(utxo)
    }

    /// Re-insert an output that a disconnected block had consumed.
    pub fn restore(&mut self, mut utxo: Utxo) -> CoreResult<()> {
        utxo.spent = false;
        self.add_utxo(utxo.address, utxo.outpoint, utxo.amount, utxo.script_pubkey)
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.by_outpoint.get(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.by_outpoint.contains_key(outpoint)
    }

    /// Unspent outputs for an address, optionally hiding locked ones.
    pub fn get_utxos(&self, address: &Address, exclude_locked: bool) -> Vec<Utxo> {
        let Some(outpoints) = self.by_address.get(address) else {
            return Vec::new();
        };
        outpoints
            .iter()
            .filter(|op| !exclude_locked || !self.pending_locks.contains_key(op))
            .filter_map(|op| self.by_outpoint.get(op))
            .cloned()
            .collect()
    }

    /// Spendable balance, honoring locks.
    pub fn balance(&self, address: &Address) -> Amount {
        self.get_utxos(address, true)
            .iter()
            .fold(Amount::ZERO, |acc, u| {
                acc.checked_add(u.amount).unwrap_or(Amount::MAX)
            })
    }

    /// Atomically lock a transaction's inputs. Fails without side
    /// effects if any outpoint is missing or already held by another
    /// transaction.
    pub fn lock(&mut self, outpoints: &[OutPoint], tx_id: TxId) -> CoreResult<()> {
        for outpoint in outpoints {
            if !self.by_outpoint.contains_key(outpoint) {
                return Err(CoreError::UtxoNotFound(outpoint.to_string()));
            }
            if let Some(owner) = self.pending_locks.get(outpoint) {
                if *owner != tx_id {
                    return Err(CoreError::DoubleSpend(format!(
                        "outpoint {outpoint} locked by {}",
                        hex::encode(owner)
                    )));
                }
            }
        }
        for outpoint in outpoints {
            self.pending_locks.insert(*outpoint, tx_id);
            self.locks_by_tx.entry(tx_id).or_default().insert(*outpoint);
        }
        Ok(())
    }

    /// Release every lock bound to a transaction. Called when the
    /// transaction is rejected, replaced, or finalized in a block; in
    /// the finalized case the outpoints are consumed immediately after.
    pub fn release_for_tx(&mut self, tx_id: &TxId) {
        if let Some(outpoints) = self.locks_by_tx.remove(tx_id) {
            for outpoint in outpoints {
                self.pending_locks.remove(&outpoint);
            }
        }
    }

    pub fn is_locked(&self, outpoint: &OutPoint) -> bool {
        self.pending_locks.contains_key(outpoint)
    }

    /// Which transaction currently holds an outpoint.
    pub fn lock_owner(&self, outpoint: &OutPoint) -> Option<TxId> {
        self.pending_locks.get(outpoint).copied()
    }

    pub fn locked_count(&self) -> usize {
        self.pending_locks.len()
    }

    pub fn len(&self) -> usize {
        self.by_outpoint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_outpoint.is_empty()
    }

    /// Sum of every unspent output: the circulating supply.
    pub fn total_value(&self) -> Amount {
        self.by_outpoint
            .values()
            .fold(Amount::ZERO, |acc, u| {
                acc.checked_add(u.amount).unwrap_or(Amount::MAX)
            })
    }

    /// Iterate all active outputs.
    pub fn iter(&self) -> impl Iterator<Item = &Utxo> {
        self.by_outpoint.values()
    }

    /// Drop everything, locks included.
    pub fn clear(&mut self) {
        self.by_outpoint.clear();
        self.by_address.clear();
        self.pending_locks.clear();
        self.locks_by_tx.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;

    fn addr(tag: &str) -> Address {
        Address::parse(
            &format!("XAI{:0>40}", hex::encode(&sha256(tag.as_bytes())[..20])),
            crate::crypto::Network::Mainnet,
        )
        .unwrap()
    }

    fn outpoint(tag: &str, vout: u32) -> OutPoint {
        OutPoint::new(sha256(tag.as_bytes()), vout)
    }

    fn seeded() -> (UtxoSet, Address, OutPoint) {
        let mut set = UtxoSet::new();
        let owner = addr("alice");
        let op = outpoint("tx1", 0);
        set.add_utxo(
            owner.clone(),
            op,
            Amount::from_coins(100).unwrap(),
            owner.as_str().to_string(),
        )
        .unwrap();
        (set, owner, op)
    }

    #[test]
    fn test_add_and_query() {
        let (set, owner, op) = seeded();
        assert_eq!(set.len(), 1);
        assert!(set.contains(&op));
        assert_eq!(set.balance(&owner), Amount::from_coins(100).unwrap());
        assert_eq!(set.get_utxos(&owner, true).len(), 1);
    }

    #[test]
    fn test_duplicate_outpoint_rejected() {
        let (mut set, owner, op) = seeded();
        let err = set
            .add_utxo(owner.clone(), op, Amount::ZERO, owner.as_str().into())
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidStructure(_)));
    }

    #[test]
    fn test_consume_removes_and_flags() {
        let (mut set, owner, op) = seeded();
        let removed = set.consume(&op).unwrap();
        assert!(removed.spent);
        assert!(!set.contains(&op));
        assert_eq!(set.balance(&owner), Amount::ZERO);

        // Spending again must fail.
        assert!(matches!(set.consume(&op), Err(CoreError::UtxoNotFound(_))));
    }

    #[test]
    fn test_restore_undoes_consume() {
        let (mut set, owner, op) = seeded();
        let removed = set.consume(&op).unwrap();
        set.restore(removed).unwrap();
        assert!(set.contains(&op));
        assert!(!set.get(&op).unwrap().spent);
        assert_eq!(set.balance(&owner), Amount::from_coins(100).unwrap());
    }

    #[test]
    fn test_lock_hides_utxos_and_blocks_second_locker() {
        let (mut set, owner, op) = seeded();
        let tx_a = sha256(b"tx_a");
        let tx_b = sha256(b"tx_b");

        set.lock(&[op], tx_a).unwrap();
        assert!(set.is_locked(&op));
        assert!(set.get_utxos(&owner, true).is_empty());
        assert_eq!(set.get_utxos(&owner, false).len(), 1);
        assert_eq!(set.balance(&owner), Amount::ZERO);

        // Same tx may re-lock its own inputs; another tx may not.
        assert!(set.lock(&[op], tx_a).is_ok());
        assert!(matches!(
            set.lock(&[op], tx_b),
            Err(CoreError::DoubleSpend(_))
        ));
    }

    #[test]
    fn test_lock_is_atomic() {
        let (mut set, owner, op1) = seeded();
        let op2 = outpoint("tx2", 0);
        set.add_utxo(
            owner.clone(),
            op2,
            Amount::from_coins(1).unwrap(),
            owner.as_str().into(),
        )
        .unwrap();

        set.lock(&[op2], sha256(b"holder")).unwrap();

        // op1 is free but the batch must fail whole, leaving op1 untouched.
        let err = set.lock(&[op1, op2], sha256(b"other")).unwrap_err();
        assert!(matches!(err, CoreError::DoubleSpend(_)));
        assert!(!set.is_locked(&op1));
    }

    #[test]
    fn test_release_for_tx() {
        let (mut set, _, op) = seeded();
        let tx_a = sha256(b"tx_a");
        set.lock(&[op], tx_a).unwrap();
        set.release_for_tx(&tx_a);
        assert!(!set.is_locked(&op));
        assert!(set.lock(&[op], sha256(b"tx_b")).is_ok());
    }

    #[test]
    fn test_consume_clears_lock() {
        let (mut set, _, op) = seeded();
        let tx_a = sha256(b"tx_a");
        set.lock(&[op], tx_a).unwrap();
        set.consume(&op).unwrap();
        assert!(!set.is_locked(&op));
        assert_eq!(set.locked_count(), 0);
    }

    #[test]
    fn test_missing_outpoint_cannot_lock() {
        let (mut set, _, _) = seeded();
        let err = set
            .lock(&[outpoint("ghost", 0)], sha256(b"tx"))
            .unwrap_err();
        assert!(matches!(err, CoreError::UtxoNotFound(_)));
    }

    #[test]
    fn test_total_value_tracks_supply() {
        let (mut set, owner, op) = seeded();
        set.add_utxo(
            addr("bob"),
            outpoint("tx2", 1),
            Amount::from_coins(50).unwrap(),
            "bob".into(),
        )
        .unwrap();
        assert_eq!(set.total_value(), Amount::from_coins(150).unwrap());
        set.consume(&op).unwrap();
        assert_eq!(set.total_value(), Amount::from_coins(50).unwrap());
        let _ = owner;
    }

    #[test]
    fn test_clear_drops_locks_too() {
        let (mut set, _, op) = seeded();
        set.lock(&[op], sha256(b"tx")).unwrap();
        set.clear();
        assert!(set.is_empty());
        assert_eq!(set.locked_count(), 0);
    }
}
