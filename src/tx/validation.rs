//! Transaction validation pipeline
//!
//! Context-aware checks run in a fixed order against the current UTXO
//! set; the first failure is reported as its reason code. Coinbase
//! transactions get structural and id checks only, since they spend
//! nothing and carry no signature.

use std::collections::HashSet;

use crate::config::ConsensusParams;
use crate::crypto::keys::Address;
use crate::crypto::sha256;
use crate::error::{CoreError, CoreResult};
use crate::tx::types::{Transaction, TransactionType};
use crate::utxo::UtxoSet;

/// Validate a transaction against the current UTXO set.
///
/// `expected_nonce` is the strict-monotonic next nonce for the sender;
/// `now` is wall-clock seconds used by time-constrained variants.
pub fn validate_transaction(
    tx: &Transaction,
    utxos: &UtxoSet,
    expected_nonce: u64,
    now: u64,
    params: &ConsensusParams,
) -> CoreResult<()> {
    validate_structure(tx, params)?;

    // The id must commit to exactly what was signed.
    if tx.txid != tx.compute_txid() {
        return Err(CoreError::InvalidStructure(
            "txid does not match canonical hash".into(),
        ));
    }

    if tx.is_coinbase() {
        return validate_coinbase_shape(tx);
    }

    validate_authorization(tx, params)?;

    if tx.nonce < expected_nonce {
        return Err(CoreError::NonceViolation {
            got: tx.nonce,
            expected: expected_nonce,
        });
    }

    validate_inputs(tx, utxos)?;
    validate_type_constraints(tx, now)?;

    Ok(())
}

pub(crate) fn validate_structure(tx: &Transaction, params: &ConsensusParams) -> CoreResult<()> {
    if tx.outputs.is_empty() {
        return Err(CoreError::InvalidStructure("no outputs".into()));
    }
    if tx.timestamp == 0 {
        return Err(CoreError::InvalidStructure("missing timestamp".into()));
    }
    // Amount and fee are range-checked by construction; outputs still
    // need a joint overflow check.
    tx.total_output()?;

    let network = params.network;
    if !tx.sender.is_coinbase() && Address::parse(tx.sender.as_str(), network).is_err() {
        return Err(CoreError::InvalidStructure(format!(
            "malformed sender '{}'",
            tx.sender
        )));
    }
    if Address::parse(tx.recipient.as_str(), network).is_err() {
        return Err(CoreError::InvalidStructure(format!(
            "malformed recipient '{}'",
            tx.recipient
        )));
    }
    for output in &tx.outputs {
        if Address::parse(output.address.as_str(), network).is_err() {
            return Err(CoreError::InvalidStructure(format!(
                "malformed output address '{}'",
                output.address
            )));
        }
    }

    let size = tx.size_bytes();
    if size > params.max_tx_bytes {
        return Err(CoreError::InvalidStructure(format!(
            "transaction size {size} exceeds limit {}",
            params.max_tx_bytes
        )));
    }
    Ok(())
}

pub(crate) fn validate_coinbase_shape(tx: &Transaction) -> CoreResult<()> {
    if !tx.sender.is_coinbase() {
        return Err(CoreError::InvalidStructure(
            "coinbase sender must be the COINBASE sentinel".into(),
        ));
    }
    if !tx.inputs.is_empty() {
        return Err(CoreError::InvalidStructure(
            "coinbase must not spend inputs".into(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_authorization(tx: &Transaction, params: &ConsensusParams) -> CoreResult<()> {
    if tx.sender.is_coinbase() || matches!(tx.tx_type, TransactionType::Coinbase) {
        // A coinbase-shaped tx that reached here lied about its type.
        return Err(CoreError::InvalidStructure(
            "coinbase type on a spending transaction".into(),
        ));
    }
    if tx.inputs.is_empty() {
        return Err(CoreError::InvalidStructure("no inputs".into()));
    }

    let key = tx
        .public_key
        .as_deref()
        .ok_or_else(|| CoreError::InvalidStructure("missing public key".into()))?;
    if key.len() != 64 {
        return Err(CoreError::InvalidStructure(format!(
            "public key length {} != 64",
            key.len()
        )));
    }
    for input in &tx.inputs {
        if input.signature.len() != 64 {
            return Err(CoreError::InvalidStructure(format!(
                "signature length {} != 64",
                input.signature.len()
            )));
        }
    }

    let mut raw = [0u8; 64];
    raw.copy_from_slice(key);
    let derived = Address::from_public_key(&raw, params.network);
    if derived != tx.sender {
        return Err(CoreError::InvalidSignature);
    }

    if !tx.verify_signatures() {
        return Err(CoreError::InvalidSignature);
    }
    Ok(())
}

pub(crate) fn validate_inputs(tx: &Transaction, utxos: &UtxoSet) -> CoreResult<()> {
    let mut seen = HashSet::with_capacity(tx.inputs.len());
    let mut input_total = crate::amount::Amount::ZERO;

    for input in &tx.inputs {
        let outpoint = input.outpoint();
        if !seen.insert(outpoint) {
            return Err(CoreError::DoubleSpend(format!(
                "outpoint {outpoint} spent twice in one transaction"
            )));
        }
        let utxo = utxos
            .get(&outpoint)
            .ok_or_else(|| CoreError::UtxoNotFound(outpoint.to_string()))?;
        if utxo.script_pubkey != tx.sender.as_str() {
            return Err(CoreError::InvalidStructure(format!(
                "outpoint {outpoint} is not spendable by {}",
                tx.sender
            )));
        }
        input_total = input_total.checked_add(utxo.amount)?;
    }

    let output_total = tx.total_output()?;
    let needed = output_total.checked_add(tx.fee)?;
    if input_total < needed {
        return Err(CoreError::InsufficientFunds {
            inputs: input_total.base_units(),
            outputs: output_total.base_units(),
            fee: tx.fee.base_units(),
        });
    }
    if input_total > needed {
        // Excess input value would be an undeclared fee bump.
        return Err(CoreError::InvalidStructure(format!(
            "inputs {} exceed outputs {} + fee {}",
            input_total, output_total, tx.fee
        )));
    }
    Ok(())
}

pub(crate) fn validate_type_constraints(tx: &Transaction, now: u64) -> CoreResult<()> {
    match &tx.tx_type {
        TransactionType::Transfer | TransactionType::Coinbase => Ok(()),
        TransactionType::TimeLocked { unlock_time } => {
            if now < *unlock_time {
                Err(CoreError::InvalidStructure(format!(
                    "time lock active until {unlock_time}"
                )))
            } else {
                Ok(())
            }
        }
        TransactionType::GovernanceVote { proposal_id } => {
            if proposal_id.is_empty() {
                Err(CoreError::InvalidStructure(
                    "governance vote without proposal id".into(),
                ))
            } else {
                Ok(())
            }
        }
        TransactionType::HtlcClaim { hash_lock, secret } => {
            if secret.is_empty() {
                return Err(CoreError::InvalidStructure("empty HTLC secret".into()));
            }
            if sha256(secret) != *hash_lock {
                return Err(CoreError::InvalidStructure(
                    "HTLC secret does not open the hash lock".into(),
                ));
            }
            Ok(())
        }
    }
}
