//! Transaction types
//!
//! A transaction moves value from a sender's unspent outputs to a list
//! of new outputs. Its id is SHA-256 over the canonical serialization
//! with signatures and the id itself excluded, so signing and hashing
//! agree on one byte layout.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::amount::Amount;
use crate::canonical::CanonicalWriter;
use crate::crypto::keys::Address;
use crate::crypto::{self, sha256};
use crate::error::{CoreError, CoreResult};

/// Transaction identifier: SHA-256 of the canonical payload.
pub type TxId = [u8; 32];

/// Reference to a single unspent output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: TxId,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: TxId, vout: u32) -> Self {
        Self { txid, vout }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(self.txid), self.vout)
    }
}

/// Tagged transaction kinds with their per-variant metadata.
///
/// Each variant's constraints are enforced by the validator before
/// admission; there is no dynamic dispatch on type names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    /// Block subsidy creation. First transaction of every block.
    Coinbase,
    /// Plain value transfer.
    Transfer,
    /// Spendable only once `unlock_time` has passed.
    TimeLocked { unlock_time: u64 },
    /// Governance ballot referencing a proposal.
    GovernanceVote { proposal_id: String },
    /// Hash time-locked claim revealing the preimage of `hash_lock`.
    HtlcClaim {
        hash_lock: [u8; 32],
        secret: Vec<u8>,
    },
}

impl TransactionType {
    /// Stable tag byte for canonical serialization.
    fn tag(&self) -> u8 {
        match self {
            TransactionType::Coinbase => 0,
            TransactionType::Transfer => 1,
            TransactionType::TimeLocked { .. } => 2,
            TransactionType::GovernanceVote { .. } => 3,
            TransactionType::HtlcClaim { .. } => 4,
        }
    }
}

/// Spend of one prior output. The signature covers the whole
/// transaction payload, not just this input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub txid: TxId,
    pub vout: u32,
    pub signature: Vec<u8>,
}

impl TxInput {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }
}

/// Newly created output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: Address,
    pub amount: Amount,
}

/// A transfer of value, signed by the sender's secp256k1 key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: Address,
    pub recipient: Address,
    pub amount: Amount,
    pub fee: Amount,
    pub tx_type: TransactionType,
    /// Strictly monotonic per sender.
    pub nonce: u64,
    pub timestamp: u64,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    /// Raw 64-byte public point of the sender; absent on coinbase.
    pub public_key: Option<Vec<u8>>,
    /// Whether the sender opted in to replace-by-fee.
    pub rbf_enabled: bool,
    pub txid: TxId,
}

impl Transaction {
    /// Build an unsigned transfer. `finalize` or `sign` must run before
    /// submission.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sender: Address,
        recipient: Address,
        amount: Amount,
        fee: Amount,
        tx_type: TransactionType,
        nonce: u64,
        timestamp: u64,
        inputs: Vec<TxInput>,
        outputs: Vec<TxOutput>,
        public_key: Option<Vec<u8>>,
    ) -> Transaction {
        let mut tx = Transaction {
            sender,
            recipient,
            amount,
            fee,
            tx_type,
            nonce,
            timestamp,
            inputs,
            outputs,
            public_key,
            rbf_enabled: false,
            txid: [0u8; 32],
        };
        tx.txid = tx.compute_txid();
        tx
    }

    /// Build the coinbase transaction for a block at `height`.
    ///
    /// The height rides in the nonce so coinbase ids stay unique even
    /// when the same miner claims identical rewards.
    pub fn coinbase(outputs: Vec<TxOutput>, height: u64, timestamp: u64) -> Transaction {
        let recipient = outputs
            .first()
            .map(|o| o.address.clone())
            .unwrap_or_else(Address::coinbase);
        let amount = outputs
            .iter()
            .fold(Amount::ZERO, |acc, o| {
                acc.checked_add(o.amount).unwrap_or(Amount::MAX)
            });
        Transaction::new(
            Address::coinbase(),
            recipient,
            amount,
            Amount::ZERO,
            TransactionType::Coinbase,
            height,
            timestamp,
            Vec::new(),
            outputs,
            None,
        )
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self.tx_type, TransactionType::Coinbase)
    }

    /// Canonical byte layout. Signatures and the txid are excluded when
    /// `include_signatures` is false; that form is what gets hashed and
    /// signed.
    pub fn canonical_bytes(&self, include_signatures: bool) -> Vec<u8> {
        let mut w = CanonicalWriter::with_capacity(256);
        w.put_str(self.sender.as_str())
            .put_str(self.recipient.as_str())
            .put_u64(self.amount.base_units())
            .put_u64(self.fee.base_units())
            .put_u8(self.tx_type.tag());
        match &self.tx_type {
            TransactionType::TimeLocked { unlock_time } => {
                w.put_u64(*unlock_time);
            }
            TransactionType::GovernanceVote { proposal_id } => {
                w.put_str(proposal_id);
            }
            TransactionType::HtlcClaim { hash_lock, secret } => {
                w.put_fixed(hash_lock).put_var(secret);
            }
            TransactionType::Coinbase | TransactionType::Transfer => {}
        }
        w.put_u64(self.nonce)
            .put_u64(self.timestamp)
            .put_u8(self.rbf_enabled as u8);
        w.put_u32(self.inputs.len() as u32);
        for input in &self.inputs {
            w.put_fixed(&input.txid).put_u32(input.vout);
            if include_signatures {
                w.put_var(&input.signature);
            }
        }
        w.put_u32(self.outputs.len() as u32);
        for output in &self.outputs {
            w.put_str(output.address.as_str()).put_u64(output.amount.base_units());
        }
        match &self.public_key {
            Some(key) => w.put_var(key),
            None => w.put_var(&[]),
        };
        w.into_bytes()
    }

    /// SHA-256 of the signature-free canonical payload.
    pub fn compute_txid(&self) -> TxId {
        sha256(&self.canonical_bytes(false))
    }

    /// Wire size used for fee-rate scoring and block packing.
    pub fn size_bytes(&self) -> usize {
        self.canonical_bytes(true).len()
    }

    /// Sign every input with the sender's key and refresh the txid.
    pub fn sign(&mut self, secret: &[u8; 32]) -> CoreResult<()> {
        let payload = self.canonical_bytes(false);
        let signature = crypto::sign(secret, &payload)
            .map_err(|_| CoreError::InvalidSignature)?
            .to_vec();
        for input in &mut self.inputs {
            input.signature = signature.clone();
        }
        self.txid = self.compute_txid();
        Ok(())
    }

    /// Check every input signature against the carried public key.
    pub fn verify_signatures(&self) -> bool {
        let key: &[u8] = match &self.public_key {
            Some(key) if key.len() == 64 => key,
            _ => return false,
        };
        let mut raw = [0u8; 64];
        raw.copy_from_slice(key);
        if self.inputs.is_empty() {
            return false;
        }
        let payload = self.canonical_bytes(false);
        self.inputs
            .iter()
            .all(|input| crypto::verify(&raw, &payload, &input.signature))
    }

    /// Sum of all output amounts.
    pub fn total_output(&self) -> CoreResult<Amount> {
        Amount::sum(self.outputs.iter().map(|o| o.amount))
    }

    pub fn txid_hex(&self) -> String {
        hex::encode(self.txid)
    }
}
