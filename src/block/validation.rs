//! Block validation pipeline
//!
//! A candidate block is checked against the current tip in a fixed
//! order: structure, linkage, header sanity, proof of work, merkle
//! commitment, every transaction, and finally the coinbase cap. The
//! cap check is the one standing between the chain and unbounded
//! issuance, so its failure is logged at error level.

use std::collections::{HashMap, HashSet};

use log::error;
use rayon::prelude::*;

use crate::amount::Amount;
use crate::block::header::BlockHeader;
use crate::block::{pow, Block};
use crate::config::ConsensusParams;
use crate::crypto::keys::Address;
use crate::error::{CoreError, CoreResult};
use crate::tx::validation as tx_checks;
use crate::utxo::UtxoSet;

/// Chain context a candidate block is judged against.
#[derive(Debug)]
pub struct BlockContext<'a> {
    /// Current canonical tip header.
    pub tip: &'a BlockHeader,
    /// Median timestamp of the recent past the header must exceed.
    pub median_time_past: u64,
    /// Wall-clock seconds for future-drift and time-lock checks.
    pub now: u64,
}

/// Validate a candidate block extending `ctx.tip`.
///
/// `expected_nonces` carries the next expected nonce per sender as of
/// the parent block; `reward` is the schedule's payout for this height.
pub fn validate_block(
    block: &Block,
    ctx: &BlockContext,
    utxos: &UtxoSet,
    expected_nonces: &HashMap<Address, u64>,
    reward: Amount,
    params: &ConsensusParams,
) -> CoreResult<()> {
    validate_shape(block, params)?;

    // Linkage decides between validation and the orphan buffer.
    if block.header.previous_hash != ctx.tip.hash() {
        return Err(CoreError::OrphanPending);
    }

    validate_header(&block.header, ctx, params)?;

    if block.compute_merkle_root() != block.header.merkle_root {
        return Err(CoreError::MerkleMismatch);
    }

    validate_transactions(block, ctx, utxos, expected_nonces, params)?;
    validate_coinbase_cap(block, reward)?;

    Ok(())
}

fn validate_shape(block: &Block, params: &ConsensusParams) -> CoreResult<()> {
    if block.transactions.is_empty() {
        return Err(CoreError::InvalidStructure("block has no transactions".into()));
    }
    if !block.transactions[0].is_coinbase() {
        return Err(CoreError::InvalidStructure(
            "first transaction must be coinbase".into(),
        ));
    }
    if block.transactions[1..].iter().any(|tx| tx.is_coinbase()) {
        return Err(CoreError::InvalidStructure(
            "more than one coinbase".into(),
        ));
    }
    let size = block.size_bytes();
    if size > params.max_block_bytes {
        return Err(CoreError::InvalidStructure(format!(
            "block size {size} exceeds limit {}",
            params.max_block_bytes
        )));
    }
    Ok(())
}

fn validate_header(
    header: &BlockHeader,
    ctx: &BlockContext,
    params: &ConsensusParams,
) -> CoreResult<()> {
    if header.index != ctx.tip.index + 1 {
        return Err(CoreError::InvalidStructure(format!(
            "height {} does not extend tip {}",
            header.index, ctx.tip.index
        )));
    }
    if header.timestamp > ctx.now + params.max_future_drift_secs {
        return Err(CoreError::InvalidStructure(format!(
            "timestamp {} too far ahead of {}",
            header.timestamp, ctx.now
        )));
    }
    if header.timestamp <= ctx.median_time_past {
        return Err(CoreError::InvalidStructure(format!(
            "timestamp {} not past median {}",
            header.timestamp, ctx.median_time_past
        )));
    }
    if header.difficulty == 0 {
        return Err(CoreError::InvalidPoW("zero difficulty".into()));
    }
    if !pow::meets_target(&header.hash(), header.difficulty) {
        return Err(CoreError::InvalidPoW(
            "header hash at or above target".into(),
        ));
    }
    Ok(())
}

fn validate_transactions(
    block: &Block,
    ctx: &BlockContext,
    utxos: &UtxoSet,
    expected_nonces: &HashMap<Address, u64>,
    params: &ConsensusParams,
) -> CoreResult<()> {
    // Stateless work first, fanned out: structure, id commitment,
    // signatures, and type constraints are independent per transaction.
    block
        .transactions
        .par_iter()
        .enumerate()
        .try_for_each(|(i, tx)| -> CoreResult<()> {
            tx_checks::validate_structure(tx, params)?;
            if tx.txid != tx.compute_txid() {
                return Err(CoreError::InvalidStructure(format!(
                    "transaction {i} txid mismatch"
                )));
            }
            if tx.is_coinbase() {
                tx_checks::validate_coinbase_shape(tx)?;
            } else {
                tx_checks::validate_authorization(tx, params)?;
                tx_checks::validate_type_constraints(tx, ctx.now)?;
            }
            Ok(())
        })?;

    // Stateful pass in block order: nonces advance per sender and no
    // two transactions may consume the same outpoint.
    let mut nonces = expected_nonces.clone();
    let mut spent_in_block: HashSet<crate::tx::OutPoint> = HashSet::new();
    for tx in block.transactions.iter().skip(1) {
        let expected = nonces.get(&tx.sender).copied().unwrap_or(0);
        if tx.nonce < expected {
            return Err(CoreError::NonceViolation {
                got: tx.nonce,
                expected,
            });
        }
        tx_checks::validate_inputs(tx, utxos)?;
        for input in &tx.inputs {
            if !spent_in_block.insert(input.outpoint()) {
                return Err(CoreError::DoubleSpend(format!(
                    "outpoint {} consumed twice in block {}",
                    input.outpoint(),
                    block.header.index
                )));
            }
        }
        nonces.insert(tx.sender.clone(), tx.nonce + 1);
    }
    Ok(())
}

fn validate_coinbase_cap(block: &Block, reward: Amount) -> CoreResult<()> {
    let coinbase = block
        .transactions
        .first()
        .expect("shape check guarantees a coinbase");
    let fees = Amount::sum(block.transactions.iter().skip(1).map(|tx| tx.fee))?;
    let allowed = reward.checked_add(fees)?;
    let outputs = coinbase.total_output()?;
    if outputs > allowed {
        error!(
            "coinbase overflow at height {}: outputs {} exceed reward {} + fees {}",
            block.header.index, outputs, reward, fees
        );
        return Err(CoreError::CoinbaseOverflow {
            outputs: outputs.base_units(),
            allowed: allowed.base_units(),
        });
    }
    Ok(())
}
