//! Fork choice and reorganization
//!
//! The canonical chain is the valid chain with the greatest cumulative
//! work; length never breaks ties. When buffered orphans form a chain
//! heavier than the tip, blocks back to the common ancestor are undone
//! in reverse, the competitor is replayed under full validation, and
//! any failure restores the previous chain exactly. Checkpointed
//! heights are final and bound how deep this can reach.

use log::{info, warn};
use primitive_types::U256;

use crate::block::{pow, Block};
use crate::chain::state::{now_secs, BlockUndo, ChainInner, ReorgEvent};
use crate::config::ConsensusParams;
use crate::error::{CoreError, CoreResult};
use crate::tx::OutPoint;

/// Look for an orphan chain outweighing the canonical tip and switch
/// to it. Returns whether a reorganization happened.
pub(crate) fn try_orphan_reorg(
    inner: &mut ChainInner,
    params: &ConsensusParams,
) -> CoreResult<bool> {
    if inner.orphans.is_empty() {
        return Ok(false);
    }
    let tip_work = *inner.work.last().expect("genesis always present");

    // Each buffered block whose parent sits on the canonical chain
    // starts a candidate; extend it greedily with further orphans.
    let mut best: Option<(u64, Vec<Block>, U256)> = None;
    for height in inner.orphans.heights() {
        if height == 0 || height as usize > inner.chain.len() {
            continue;
        }
        let parent_index = (height - 1) as usize;
        let parent_hash = inner.chain[parent_index].hash();
        let starts: Vec<Block> = inner
            .orphans
            .at_height(height)
            .iter()
            .filter(|b| b.header.previous_hash == parent_hash)
            .cloned()
            .collect();
        for start in starts {
            let mut candidate = vec![start.clone()];
            candidate.extend(inner.orphans.build_chain_from(height + 1, &start.hash()));

            let mut work = inner.work[parent_index];
            for block in &candidate {
                work = work + pow::block_work(block.header.difficulty);
            }
            if work > tip_work && best.as_ref().map_or(true, |(_, _, w)| work > *w) {
                best = Some((height - 1, candidate, work));
            }
        }
    }

    let Some((fork_height, candidate, candidate_work)) = best else {
        return Ok(false);
    };
    info!(
        "orphan chain from height {} carries more work than the tip ({} blocks, work {})",
        fork_height + 1,
        candidate.len(),
        candidate_work
    );
    perform_reorg(inner, params, fork_height, candidate)?;
    Ok(true)
}

/// Switch to `candidate`, which forks off at `fork_height`.
fn perform_reorg(
    inner: &mut ChainInner,
    params: &ConsensusParams,
    fork_height: u64,
    candidate: Vec<Block>,
) -> CoreResult<()> {
    if fork_height < inner.finalized_height {
        return Err(CoreError::ReorgRejected(format!(
            "fork at height {fork_height} crosses checkpoint at {}",
            inner.finalized_height
        )));
    }
    let keep = (fork_height + 1) as usize;
    let disconnected: Vec<Block> = inner.chain[keep..].to_vec();
    let removed_undo: Vec<BlockUndo> = inner.undo[keep..].to_vec();
    let removed_work: Vec<U256> = inner.work[keep..].to_vec();
    let utxos_snapshot = inner.utxos.clone();
    let nonces_snapshot = inner.nonces.clone();

    info!(
        "reorganizing: disconnecting {} blocks above height {fork_height}",
        disconnected.len()
    );

    // Undo tip-first so later blocks release outputs earlier ones made.
    for (offset, block) in disconnected.iter().enumerate().rev() {
        disconnect_block(inner, block, &removed_undo[offset])?;
    }
    for block in &disconnected {
        inner.hash_index.remove(&block.hash());
    }
    inner.chain.truncate(keep);
    inner.work.truncate(keep);
    inner.undo.truncate(keep);
    inner.index.rollback_to_block(fork_height)?;
    inner.store.truncate_above(fork_height)?;

    // Replay the competitor under full validation.
    let mut replay_error = None;
    let mut connected: Vec<Block> = Vec::new();
    for block in &candidate {
        match inner.validate_and_apply(block.clone(), params, true) {
            Ok(()) => connected.push(block.clone()),
            Err(err) => {
                replay_error = Some(err);
                break;
            }
        }
    }

    if let Some(err) = replay_error {
        warn!("reorg replay failed ({err}); restoring previous chain");
        restore_previous_chain(
            inner,
            fork_height,
            &disconnected,
            removed_undo,
            removed_work,
            utxos_snapshot,
            nonces_snapshot,
        )?;
        return Err(CoreError::ReorgRejected(format!("replay failed: {err}")));
    }

    for block in &connected {
        inner.orphans.remove(block.header.index, &block.hash());
    }

    // Displaced transactions go back through mempool admission; the
    // stale ones drop on their own rejections.
    let now = now_secs();
    for block in &disconnected {
        for tx in block.transactions.iter().skip(1) {
            let expected = inner
                .nonces
                .get(&tx.sender)
                .copied()
                .unwrap_or(0);
            let ChainInner { mempool, utxos, .. } = inner;
            let _ = mempool.add(tx.clone(), utxos, expected, now, params);
        }
    }

    let new_tip = inner.tip().header.clone();
    info!(
        "reorg complete: tip {} at height {}",
        hex::encode(new_tip.hash()),
        new_tip.index
    );
    inner.publish(ReorgEvent {
        connected,
        disconnected,
    });
    Ok(())
}

/// Undo one block's effect on the UTXO set and nonce map.
pub(crate) fn disconnect_block(
    inner: &mut ChainInner,
    block: &Block,
    undo: &BlockUndo,
) -> CoreResult<()> {
    // Remove the outputs this block created.
    for tx in &block.transactions {
        for vout in 0..tx.outputs.len() {
            let outpoint = OutPoint::new(tx.txid, vout as u32);
            inner.utxos.consume(&outpoint).map_err(|e| {
                CoreError::ReorgRejected(format!("disconnect height {}: {e}", block.header.index))
            })?;
        }
    }
    // Bring back what it consumed.
    for utxo in &undo.consumed {
        inner.utxos.restore(utxo.clone()).map_err(|e| {
            CoreError::ReorgRejected(format!("restore height {}: {e}", block.header.index))
        })?;
    }
    // Rewind sender nonces.
    for (address, previous) in &undo.prev_nonces {
        match previous {
            Some(value) => inner.nonces.insert(address.clone(), *value),
            None => inner.nonces.remove(address),
        };
    }
    Ok(())
}

/// Put the pre-reorg chain back after a failed replay.
#[allow(clippy::too_many_arguments)]
fn restore_previous_chain(
    inner: &mut ChainInner,
    fork_height: u64,
    disconnected: &[Block],
    removed_undo: Vec<BlockUndo>,
    removed_work: Vec<U256>,
    utxos_snapshot: crate::utxo::UtxoSet,
    nonces_snapshot: std::collections::HashMap<crate::crypto::keys::Address, u64>,
) -> CoreResult<()> {
    let keep = (fork_height + 1) as usize;

    // Drop whatever part of the candidate connected.
    let partial: Vec<Block> = inner.chain[keep..].to_vec();
    for block in &partial {
        inner.hash_index.remove(&block.hash());
    }
    inner.chain.truncate(keep);
    inner.work.truncate(keep);
    inner.undo.truncate(keep);
    inner.index.rollback_to_block(fork_height)?;
    inner.store.truncate_above(fork_height)?;

    inner.utxos = utxos_snapshot;
    inner.nonces = nonces_snapshot;

    for (offset, block) in disconnected.iter().enumerate() {
        inner.hash_index.insert(block.hash(), block.header.index);
        inner.chain.push(block.clone());
        inner.work.push(removed_work[offset]);
        inner.undo.push(removed_undo[offset].clone());
        inner.store.save_block(block)?;
        for (tx_index, tx) in block.transactions.iter().enumerate() {
            inner.index.index_transaction(
                tx,
                block.header.index,
                tx_index as u32,
                block.header.timestamp,
            )?;
        }
    }
    inner.store.save_tip(&inner.tip().hash())?;
    Ok(())
}
