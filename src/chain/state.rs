//! Chain state
//!
//! The single owner of consensus state: the canonical chain, UTXO set,
//! mempool, orphan buffers, and address index. One reader-writer lock
//! serializes every mutation; readers share it and never observe a
//! partially applied block. Collaborators talk to the engine only
//! through this type's API.

use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use parking_lot::RwLock;
use primitive_types::U256;

use crate::amount::Amount;
use crate::block::{pow, validate_block, Block, BlockContext, BlockHash, BlockHeader, HEADER_VERSION};
use crate::chain::orphans::OrphanBlockPool;
use crate::chain::{reorg, supply};
use crate::checkpoint::CheckpointManager;
use crate::config::ConsensusParams;
use crate::crypto::keys::Address;
use crate::error::{CoreError, CoreResult};
use crate::index::{AddressIndex, HistoryEntry};
use crate::mempool::{Mempool, MempoolOverview, TxOutcome};
use crate::merkle::merkle_root;
use crate::storage::BlockStore;
use crate::tx::{OutPoint, Transaction, TxId};
use crate::utxo::{Utxo, UtxoSet};

/// Outcome of a block submission that was not rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Extended the canonical chain (directly or via reorganization).
    Accepted,
    /// Buffered until its parent arrives.
    Orphaned,
}

/// Canonical tip summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipInfo {
    pub height: u64,
    pub hash: BlockHash,
    pub cumulative_work: U256,
    pub difficulty: u64,
}

/// Delta delivered to reorg subscribers.
#[derive(Debug, Clone)]
pub struct ReorgEvent {
    pub connected: Vec<Block>,
    pub disconnected: Vec<Block>,
}

/// Everything needed to undo one applied block.
#[derive(Debug, Clone)]
pub(crate) struct BlockUndo {
    /// UTXOs the block consumed, in consumption order.
    pub(crate) consumed: Vec<Utxo>,
    /// Expected-nonce entries before the block, for senders it touched.
    pub(crate) prev_nonces: HashMap<Address, Option<u64>>,
}

pub(crate) struct ChainInner {
    pub(crate) chain: Vec<Block>,
    /// Cumulative work at each height, parallel to `chain`.
    pub(crate) work: Vec<U256>,
    /// Undo data per height, parallel to `chain`.
    pub(crate) undo: Vec<BlockUndo>,
    pub(crate) hash_index: HashMap<BlockHash, u64>,
    pub(crate) utxos: UtxoSet,
    /// Next expected nonce per sender.
    pub(crate) nonces: HashMap<Address, u64>,
    pub(crate) mempool: Mempool,
    pub(crate) orphans: OrphanBlockPool,
    pub(crate) index: AddressIndex,
    pub(crate) store: BlockStore,
    pub(crate) checkpoints: CheckpointManager,
    /// Height of the latest checkpoint; reorgs may not cross it.
    pub(crate) finalized_height: u64,
    pub(crate) subscribers: Vec<Sender<ReorgEvent>>,
}

/// The consensus engine's in-process API.
pub struct ChainState {
    params: ConsensusParams,
    inner: RwLock<ChainInner>,
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Deterministic genesis block for a parameter set.
fn genesis_block(params: &ConsensusParams) -> Block {
    let coinbase = Transaction::coinbase(
        vec![crate::tx::types::TxOutput {
            address: Address::from_raw(&params.genesis_address),
            amount: params.genesis_allocation,
        }],
        0,
        params.genesis_timestamp,
    );
    let header = BlockHeader {
        index: 0,
        previous_hash: [0u8; 32],
        merkle_root: merkle_root(&[coinbase.txid]),
        timestamp: params.genesis_timestamp,
        difficulty: 1,
        nonce: 0,
        version: HEADER_VERSION,
    };
    Block::new(header, vec![coinbase])
}

impl ChainState {
    /// Open or initialize a chain under `data_dir`.
    ///
    /// An empty directory gets the genesis block; an existing chain is
    /// replayed from its block files, the address index is rebuilt, and
    /// any persisted mempool snapshot is re-admitted.
    pub fn open(params: ConsensusParams, data_dir: &Path) -> CoreResult<ChainState> {
        let store = BlockStore::open(data_dir)?;
        let index = AddressIndex::open(&data_dir.join("address_index"))?;
        let checkpoints = CheckpointManager::open(&data_dir.join("checkpoints"))?;
        let finalized_height = checkpoints.latest_height()?.unwrap_or(0);

        let mut inner = ChainInner {
            chain: Vec::new(),
            work: Vec::new(),
            undo: Vec::new(),
            hash_index: HashMap::new(),
            utxos: UtxoSet::new(),
            nonces: HashMap::new(),
            mempool: Mempool::new(),
            orphans: OrphanBlockPool::new(),
            index,
            store,
            checkpoints,
            finalized_height,
            subscribers: Vec::new(),
        };

        let persisted = inner.store.load_chain()?;
        if persisted.is_empty() {
            let genesis = genesis_block(&params);
            info!(
                "initializing chain with genesis {} (allocation {})",
                hex::encode(genesis.hash()),
                params.genesis_allocation
            );
            inner.apply(genesis, &params, true)?;
        } else {
            info!("replaying {} persisted blocks", persisted.len());
            for block in persisted {
                inner.apply(block, &params, false)?;
            }
            inner.index.rebuild_from_chain(&inner.chain)?;
            inner.store.save_tip(&inner.tip().hash())?;
        }

        let now = now_secs();
        let snapshot = inner.store.take_mempool()?;
        if !snapshot.is_empty() {
            info!("re-admitting {} persisted mempool transactions", snapshot.len());
            for tx in snapshot {
                let expected = inner.expected_nonce(&tx.sender);
                let ChainInner { mempool, utxos, .. } = &mut inner;
                // Stale entries drop on their own rejection.
                let _ = mempool.add(tx, utxos, expected, now, &params);
            }
        }

        Ok(ChainState {
            params,
            inner: RwLock::new(inner),
        })
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    /// Submit a transaction for mempool admission.
    pub fn submit_transaction(&self, tx: Transaction) -> CoreResult<TxOutcome> {
        let mut inner = self.inner.write();
        let expected = inner.expected_nonce(&tx.sender);
        let now = now_secs();
        let ChainInner { mempool, utxos, .. } = &mut *inner;
        mempool.add(tx, utxos, expected, now, &self.params)
    }

    /// Submit a block. Extends the tip, or buffers as an orphan and
    /// checks whether the orphan's chain now outweighs the canonical
    /// one.
    pub fn submit_block(&self, block: Block) -> CoreResult<BlockOutcome> {
        let mut inner = self.inner.write();
        let hash = block.hash();
        if inner.hash_index.contains_key(&hash) {
            return Err(CoreError::InvalidStructure("duplicate block".into()));
        }

        let tip = inner.tip().header.clone();
        if block.header.previous_hash == tip.hash() && block.header.index == tip.index + 1 {
            inner.validate_and_apply(block, &self.params, true)?;
            inner.post_accept(&self.params);
            Ok(BlockOutcome::Accepted)
        } else {
            inner.orphans.insert(block);
            let reorged = reorg::try_orphan_reorg(&mut inner, &self.params)?;
            if reorged {
                inner.post_accept(&self.params);
            }
            if inner.hash_index.contains_key(&hash) {
                Ok(BlockOutcome::Accepted)
            } else {
                Ok(BlockOutcome::Orphaned)
            }
        }
    }

    pub fn get_tip(&self) -> TipInfo {
        let inner = self.inner.read();
        let tip = inner.tip();
        TipInfo {
            height: tip.header.index,
            hash: tip.hash(),
            cumulative_work: *inner.work.last().expect("genesis always present"),
            difficulty: tip.header.difficulty,
        }
    }

    pub fn get_block_at(&self, index: u64) -> Option<Block> {
        self.inner.read().chain.get(index as usize).cloned()
    }

    pub fn get_block_by_hash(&self, hash: &BlockHash) -> Option<Block> {
        let inner = self.inner.read();
        let index = *inner.hash_index.get(hash)?;
        inner.chain.get(index as usize).cloned()
    }

    /// Spendable balance: unspent outputs not locked by pending
    /// transactions.
    pub fn get_balance(&self, address: &Address) -> Amount {
        self.inner.read().utxos.balance(address)
    }

    pub fn get_utxos(&self, address: &Address) -> Vec<Utxo> {
        self.inner.read().utxos.get_utxos(address, true)
    }

    pub fn get_transaction_history(
        &self,
        address: &Address,
        limit: usize,
        offset: usize,
    ) -> CoreResult<(Vec<HistoryEntry>, usize)> {
        self.inner.read().index.get_transactions(address, limit, offset)
    }

    pub fn get_mempool_overview(&self, limit: usize) -> MempoolOverview {
        self.inner
            .read()
            .mempool
            .overview(limit, now_secs(), &self.params)
    }

    pub fn estimate_fee(&self, size_bytes: usize) -> Amount {
        self.inner
            .read()
            .mempool
            .estimate_fee(size_bytes, now_secs(), &self.params)
    }

    /// Sum of all unspent outputs.
    pub fn get_circulating_supply(&self) -> Amount {
        self.inner.read().utxos.total_value()
    }

    /// Highest-paying pending transactions under block budgets, for
    /// miners assembling a template.
    pub fn select_transactions(&self, budget_bytes: usize, budget_sigops: usize) -> Vec<Transaction> {
        self.inner
            .read()
            .mempool
            .select_for_block(budget_bytes, budget_sigops)
    }

    /// Difficulty the retarget schedule suggests for the next block.
    pub fn next_difficulty(&self) -> u64 {
        let inner = self.inner.read();
        let window = self.params.retarget_interval as usize + 1;
        let start = inner.chain.len().saturating_sub(window);
        let headers: Vec<BlockHeader> = inner.chain[start..]
            .iter()
            .map(|b| b.header.clone())
            .collect();
        pow::next_difficulty(&headers, &self.params)
    }

    /// Register for `{connected, disconnected}` reorganization deltas.
    pub fn subscribe(&self) -> Receiver<ReorgEvent> {
        let (tx, rx) = channel();
        self.inner.write().subscribers.push(tx);
        rx
    }

    /// Graceful shutdown: persist pending transactions and release
    /// their locks.
    pub fn shutdown(&self) -> CoreResult<()> {
        let mut inner = self.inner.write();
        let pending = inner.mempool.snapshot();
        info!("shutdown: persisting {} mempool transactions", pending.len());
        inner.store.save_mempool(&pending)?;
        let ChainInner { mempool, utxos, .. } = &mut *inner;
        mempool.clear(utxos);
        Ok(())
    }
}

impl ChainInner {
    pub(crate) fn tip(&self) -> &Block {
        self.chain.last().expect("genesis always present")
    }

    pub(crate) fn expected_nonce(&self, address: &Address) -> u64 {
        self.nonces.get(address).copied().unwrap_or(0)
    }

    /// Median of the last `median_time_window` block timestamps.
    pub(crate) fn median_time_past(&self, window: usize) -> u64 {
        let start = self.chain.len().saturating_sub(window);
        let mut stamps: Vec<u64> = self.chain[start..]
            .iter()
            .map(|b| b.header.timestamp)
            .collect();
        if stamps.is_empty() {
            return 0;
        }
        stamps.sort_unstable();
        stamps[stamps.len() / 2]
    }

    /// Run the full validation pipeline, then apply.
    pub(crate) fn validate_and_apply(
        &mut self,
        block: Block,
        params: &ConsensusParams,
        durable: bool,
    ) -> CoreResult<()> {
        let reward = supply::block_reward(block.header.index, self.utxos.total_value(), params);
        let tip = self.tip().header.clone();
        let ctx = BlockContext {
            tip: &tip,
            median_time_past: self.median_time_past(params.median_time_window),
            now: now_secs(),
        };
        validate_block(&block, &ctx, &self.utxos, &self.nonces, reward, params)?;
        self.apply(block, params, durable)
    }

    /// Mutate state for an already validated block.
    ///
    /// Inside the writer section the order is fixed: UTXO mutations,
    /// address-index append, durable block write, then the in-memory
    /// header append. Readers see all of it or none of it.
    pub(crate) fn apply(
        &mut self,
        block: Block,
        params: &ConsensusParams,
        durable: bool,
    ) -> CoreResult<()> {
        let height = block.header.index;

        // Consume inputs, keeping undo data. On mid-flight failure the
        // consumed entries go straight back.
        let mut consumed: Vec<Utxo> = Vec::new();
        for tx in block.transactions.iter().skip(1) {
            for input in &tx.inputs {
                match self.utxos.consume(&input.outpoint()) {
                    Ok(utxo) => consumed.push(utxo),
                    Err(err) => {
                        for utxo in &consumed {
                            let _ = self.utxos.restore(utxo.clone());
                        }
                        return Err(err);
                    }
                }
            }
        }

        // Create outputs.
        let mut created: Vec<OutPoint> = Vec::new();
        for tx in &block.transactions {
            for (vout, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(tx.txid, vout as u32);
                if let Err(err) = self.utxos.add_utxo(
                    output.address.clone(),
                    outpoint,
                    output.amount,
                    output.address.as_str().to_string(),
                ) {
                    for outpoint in &created {
                        let _ = self.utxos.consume(outpoint);
                    }
                    for utxo in &consumed {
                        let _ = self.utxos.restore(utxo.clone());
                    }
                    return Err(err);
                }
                created.push(outpoint);
            }
        }

        // Advance sender nonces, remembering prior values.
        let mut prev_nonces: HashMap<Address, Option<u64>> = HashMap::new();
        for tx in block.transactions.iter().skip(1) {
            prev_nonces
                .entry(tx.sender.clone())
                .or_insert_with(|| self.nonces.get(&tx.sender).copied());
            self.nonces.insert(tx.sender.clone(), tx.nonce + 1);
        }

        if durable {
            for (tx_index, tx) in block.transactions.iter().enumerate() {
                self.index.index_transaction(
                    tx,
                    height,
                    tx_index as u32,
                    block.header.timestamp,
                )?;
            }
            self.store.save_block(&block)?;
            self.store.save_tip(&block.hash())?;
        }

        // Included transactions leave the pool; their locks vanished
        // when the inputs were consumed.
        let included: Vec<TxId> = block
            .transactions
            .iter()
            .skip(1)
            .map(|tx| tx.txid)
            .collect();
        self.mempool.evict_included(included);

        let parent_work = self.work.last().copied().unwrap_or_default();
        self.work
            .push(parent_work + pow::block_work(block.header.difficulty));
        self.undo.push(BlockUndo {
            consumed,
            prev_nonces,
        });
        self.hash_index.insert(block.hash(), height);
        self.chain.push(block);

        if durable && height > 0 && height % params.checkpoint_interval == 0 {
            let tip = self.tip().header.clone();
            let snapshot: Vec<Utxo> = self.utxos.iter().cloned().collect();
            self.checkpoints
                .write_checkpoint(&tip, &snapshot, self.utxos.total_value())?;
            self.finalized_height = height;
        }
        Ok(())
    }

    /// Housekeeping after the tip advanced: connect waiting orphans,
    /// prune hopeless ones, and retry buffered orphan transactions.
    pub(crate) fn post_accept(&mut self, params: &ConsensusParams) {
        loop {
            let tip = self.tip().header.clone();
            let Some(child) = self.orphans.take_child(tip.index + 1, &tip.hash()) else {
                break;
            };
            let child_hash = child.hash();
            if let Err(err) = self.validate_and_apply(child, params, true) {
                warn!(
                    "orphan block {} failed to connect: {err}",
                    hex::encode(child_hash)
                );
            }
        }

        let tip_height = self.tip().header.index;
        self.orphans
            .prune_below(tip_height.saturating_sub(params.orphan_block_depth));

        let now = now_secs();
        let ChainInner {
            mempool,
            utxos,
            nonces,
            ..
        } = self;
        mempool.retry_orphans(
            utxos,
            |address| nonces.get(address).copied().unwrap_or(0),
            now,
            params,
        );
    }

    pub(crate) fn publish(&mut self, event: ReorgEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyPair, Network};
    use crate::mempool::PressureState;
    use crate::tx::types::{TransactionType, TxInput, TxOutput};
    use tempfile::tempdir;

    struct Wallet {
        pair: KeyPair,
        address: Address,
    }

    fn wallet() -> Wallet {
        let pair = KeyPair::generate();
        let address = pair.address(Network::Mainnet);
        Wallet { pair, address }
    }

    fn open_state(dir: &Path) -> ChainState {
        ChainState::open(ConsensusParams::regtest(), dir).unwrap()
    }

    /// Assemble and mine a block extending the current tip.
    fn build_block(
        state: &ChainState,
        miner: &Address,
        txs: Vec<Transaction>,
        difficulty: u64,
    ) -> Block {
        let tip = state.get_tip();
        let tip_block = state.get_block_at(tip.height).unwrap();
        build_block_on(state, &tip_block, miner, txs, difficulty)
    }

    /// Assemble and mine a block extending an arbitrary parent.
    fn build_block_on(
        state: &ChainState,
        parent: &Block,
        miner: &Address,
        txs: Vec<Transaction>,
        difficulty: u64,
    ) -> Block {
        let height = parent.header.index + 1;
        let supply = state.get_circulating_supply();
        let reward = supply::block_reward(height, supply, state.params());
        let fees = Amount::sum(txs.iter().map(|tx| tx.fee)).unwrap();
        let timestamp = parent.header.timestamp + 60;

        let coinbase = Transaction::coinbase(
            vec![TxOutput {
                address: miner.clone(),
                amount: reward.checked_add(fees).unwrap(),
            }],
            height,
            timestamp,
        );
        let mut transactions = vec![coinbase];
        transactions.extend(txs);
        let txids: Vec<[u8; 32]> = transactions.iter().map(|tx| tx.txid).collect();

        let mut header = BlockHeader {
            index: height,
            previous_hash: parent.hash(),
            merkle_root: merkle_root(&txids),
            timestamp,
            difficulty,
            nonce: 0,
            version: HEADER_VERSION,
        };
        pow::mine(&mut header);
        Block::new(header, transactions)
    }

    /// Spend the wallet's whole spendable balance: `send` to a fresh
    /// recipient, fee, and change back to the wallet.
    fn transfer_all(
        state: &ChainState,
        from: &Wallet,
        recipient: &Address,
        send: Amount,
        fee: Amount,
        nonce: u64,
        rbf: bool,
    ) -> Transaction {
        let utxos = state.get_utxos(&from.address);
        assert!(!utxos.is_empty(), "wallet has no spendable outputs");
        let total = Amount::sum(utxos.iter().map(|u| u.amount)).unwrap();
        let change = total.checked_sub(send).unwrap().checked_sub(fee).unwrap();

        let inputs = utxos
            .iter()
            .map(|u| TxInput {
                txid: u.outpoint.txid,
                vout: u.outpoint.vout,
                signature: Vec::new(),
            })
            .collect();
        let mut outputs = vec![TxOutput {
            address: recipient.clone(),
            amount: send,
        }];
        if !change.is_zero() {
            outputs.push(TxOutput {
                address: from.address.clone(),
                amount: change,
            });
        }
        let mut tx = Transaction::new(
            from.address.clone(),
            recipient.clone(),
            send,
            fee,
            TransactionType::Transfer,
            nonce,
            now_secs(),
            inputs,
            outputs,
            Some(from.pair.public_bytes().to_vec()),
        );
        tx.rbf_enabled = rbf;
        tx.sign(from.pair.secret_bytes()).unwrap();
        tx
    }

    fn fund_wallet(state: &ChainState, w: &Wallet) {
        let block = build_block(state, &w.address, Vec::new(), 1);
        assert_eq!(state.submit_block(block).unwrap(), BlockOutcome::Accepted);
    }

    #[test]
    fn test_genesis_initialization() {
        let dir = tempdir().unwrap();
        let state = open_state(dir.path());

        let tip = state.get_tip();
        assert_eq!(tip.height, 0);
        assert_eq!(
            state.get_circulating_supply(),
            state.params().genesis_allocation
        );
        let genesis_addr = Address::from_raw(&state.params().genesis_address);
        assert_eq!(state.get_balance(&genesis_addr), state.params().genesis_allocation);
    }

    #[test]
    fn test_mining_extends_chain_and_pays_reward() {
        let dir = tempdir().unwrap();
        let state = open_state(dir.path());
        let miner = wallet();

        fund_wallet(&state, &miner);

        let tip = state.get_tip();
        assert_eq!(tip.height, 1);
        assert_eq!(
            state.get_balance(&miner.address),
            Amount::from_coins(12).unwrap()
        );
        // Chain invariant: each block links its parent.
        let genesis = state.get_block_at(0).unwrap();
        let block1 = state.get_block_at(1).unwrap();
        assert_eq!(block1.header.previous_hash, genesis.hash());
        assert_eq!(state.get_block_by_hash(&block1.hash()).unwrap(), block1);
    }

    #[test]
    fn test_coinbase_overflow_rejected() {
        let dir = tempdir().unwrap();
        let state = open_state(dir.path());
        let miner = wallet();

        // Coinbase claiming ten times the schedule.
        let mut block = build_block(&state, &miner.address, Vec::new(), 1);
        let reward = block.transactions[0].outputs[0].amount;
        block.transactions[0] = Transaction::coinbase(
            vec![TxOutput {
                address: miner.address.clone(),
                amount: reward.checked_mul(10).unwrap(),
            }],
            1,
            block.header.timestamp,
        );
        block.header.merkle_root =
            merkle_root(&block.transactions.iter().map(|t| t.txid).collect::<Vec<_>>());
        pow::mine(&mut block.header);

        let err = state.submit_block(block).unwrap_err();
        assert!(matches!(err, CoreError::CoinbaseOverflow { .. }));
        assert_eq!(state.get_tip().height, 0);
    }

    #[test]
    fn test_double_spend_in_mempool_then_mine() {
        let dir = tempdir().unwrap();
        let state = open_state(dir.path());
        let w = wallet();
        let (x, y) = (wallet(), wallet());
        fund_wallet(&state, &w);

        let balance = state.get_balance(&w.address);
        assert_eq!(balance, Amount::from_coins(12).unwrap());
        let fee = Amount::from_decimal_str("0.1").unwrap();
        let send = Amount::from_coins(11).unwrap();

        let tx_a = transfer_all(&state, &w, &x.address, send, fee, 0, false);
        assert_eq!(state.submit_transaction(tx_a.clone()).unwrap(), TxOutcome::Accepted);

        // Same single UTXO, different recipient.
        let tx_b = transfer_all_unlocked(&state, &w, &y.address, send, "0.1", 1);
        let err = state.submit_transaction(tx_b).unwrap_err();
        assert!(matches!(err, CoreError::DoubleSpend(_)));
        assert_eq!(state.get_mempool_overview(10).pending_count, 1);

        // Mine tx_a; balances settle exactly once.
        let miner = wallet();
        let block = build_block(&state, &miner.address, vec![tx_a], 1);
        state.submit_block(block).unwrap();

        assert_eq!(
            state.get_balance(&w.address),
            Amount::from_decimal_str("0.9").unwrap()
        );
        assert_eq!(state.get_balance(&x.address), send);
        assert_eq!(state.get_balance(&y.address), Amount::ZERO);
        assert_eq!(state.get_mempool_overview(10).pending_count, 0);
    }

    #[test]
    fn test_rbf_lock_handoff() {
        let dir = tempdir().unwrap();
        let state = open_state(dir.path());
        let w = wallet();
        let recipient = wallet();
        fund_wallet(&state, &w);

        let send = Amount::from_coins(10).unwrap();
        let tx_a = transfer_all(
            &state,
            &w,
            &recipient.address,
            send,
            Amount::from_decimal_str("0.1").unwrap(),
            0,
            true,
        );
        state.submit_transaction(tx_a).unwrap();
        // Inputs locked: nothing spendable remains.
        assert!(state.get_utxos(&w.address).is_empty());

        let tx_b = transfer_all_unlocked(&state, &w, &recipient.address, send, "0.25", 0);
        state.submit_transaction(tx_b.clone()).unwrap();

        let overview = state.get_mempool_overview(10);
        assert_eq!(overview.pending_count, 1);
        assert_eq!(overview.top[0].0, tx_b.txid_hex());
        assert!(state.get_utxos(&w.address).is_empty());
    }

    /// Like `transfer_all` but selects outputs ignoring locks, for
    /// building RBF replacements over the same inputs.
    fn transfer_all_unlocked(
        state: &ChainState,
        from: &Wallet,
        recipient: &Address,
        send: Amount,
        fee: &str,
        nonce: u64,
    ) -> Transaction {
        let fee = Amount::from_decimal_str(fee).unwrap();
        let utxos = state.inner.read().utxos.get_utxos(&from.address, false);
        let total = Amount::sum(utxos.iter().map(|u| u.amount)).unwrap();
        let change = total.checked_sub(send).unwrap().checked_sub(fee).unwrap();
        let inputs = utxos
            .iter()
            .map(|u| TxInput {
                txid: u.outpoint.txid,
                vout: u.outpoint.vout,
                signature: Vec::new(),
            })
            .collect();
        let mut outputs = vec![TxOutput {
            address: recipient.clone(),
            amount: send,
        }];
        if !change.is_zero() {
            outputs.push(TxOutput {
                address: from.address.clone(),
                amount: change,
            });
        }
        let mut tx = Transaction::new(
            from.address.clone(),
            recipient.clone(),
            send,
            fee,
            TransactionType::Transfer,
            nonce,
            now_secs(),
            inputs,
            outputs,
            Some(from.pair.public_bytes().to_vec()),
        );
        tx.sign(from.pair.secret_bytes()).unwrap();
        tx
    }

    #[test]
    fn test_orphan_block_attaches_when_parent_arrives() {
        let dir = tempdir().unwrap();
        let state = open_state(dir.path());
        let miner = wallet();

        let b1 = build_block(&state, &miner.address, Vec::new(), 1);
        let b2 = build_block_on(&state, &b1, &miner.address, Vec::new(), 1);

        // Child first: buffered, tip unchanged.
        assert_eq!(state.submit_block(b2.clone()).unwrap(), BlockOutcome::Orphaned);
        assert_eq!(state.get_tip().height, 0);

        // Parent arrives: both connect atomically.
        assert_eq!(state.submit_block(b1).unwrap(), BlockOutcome::Accepted);
        let tip = state.get_tip();
        assert_eq!(tip.height, 2);
        assert_eq!(tip.hash, b2.hash());
    }

    #[test]
    fn test_heavier_shorter_chain_reorgs() {
        let dir = tempdir().unwrap();
        let state = open_state(dir.path());
        let miner = wallet();
        let rival = wallet();

        // Canonical: four difficulty-1 blocks.
        for _ in 0..4 {
            fund_wallet(&state, &miner);
        }
        let before = state.get_tip();
        assert_eq!(before.height, 4);

        // Competitor forks at height 1 with difficulty-2 blocks: one
        // block shorter, but heavier once both are in.
        let fork_parent = state.get_block_at(1).unwrap();
        let c2 = build_block_on(&state, &fork_parent, &rival.address, Vec::new(), 2);
        let c3 = build_block_on(&state, &c2, &rival.address, Vec::new(), 2);

        assert_eq!(state.submit_block(c2.clone()).unwrap(), BlockOutcome::Orphaned);
        let events = state.subscribe();
        let outcome = state.submit_block(c3.clone()).unwrap();
        assert_eq!(outcome, BlockOutcome::Accepted);

        let after = state.get_tip();
        assert_eq!(after.height, 3);
        assert_eq!(after.hash, c3.hash());
        assert!(after.cumulative_work > before.cumulative_work);

        let event = events.try_recv().unwrap();
        assert_eq!(event.disconnected.len(), 3);
        assert_eq!(event.connected.len(), 2);

        // The old miner's rewards above the fork are gone; the rival's
        // two coinbases stand.
        assert_eq!(
            state.get_balance(&rival.address),
            Amount::from_coins(24).unwrap()
        );
        assert_eq!(
            state.get_balance(&miner.address),
            Amount::from_coins(12).unwrap()
        );

        // The address index was rewound and reapplied.
        let (rows, total) = state
            .get_transaction_history(&rival.address, 10, 0)
            .unwrap();
        assert_eq!(total, 2);
        assert!(rows.iter().all(|r| r.block_index <= 3));
        let (_, miner_total) = state
            .get_transaction_history(&miner.address, 10, 0)
            .unwrap();
        assert_eq!(miner_total, 1);
    }

    #[test]
    fn test_reorg_returns_transactions_to_mempool() {
        let dir = tempdir().unwrap();
        let state = open_state(dir.path());
        let w = wallet();
        let recipient = wallet();
        let rival = wallet();
        fund_wallet(&state, &w);

        // Mine w's spend into the canonical chain at height 2.
        let tx = transfer_all(
            &state,
            &w,
            &recipient.address,
            Amount::from_coins(5).unwrap(),
            Amount::from_decimal_str("0.1").unwrap(),
            0,
            false,
        );
        state.submit_transaction(tx.clone()).unwrap();
        let b2 = build_block(&state, &w.address, vec![tx.clone()], 1);
        state.submit_block(b2).unwrap();
        assert_eq!(state.get_mempool_overview(10).pending_count, 0);

        // A heavier fork from height 1 excludes the spend.
        let fork_parent = state.get_block_at(1).unwrap();
        let c2 = build_block_on(&state, &fork_parent, &rival.address, Vec::new(), 8);
        state.submit_block(c2).unwrap();

        // The displaced transfer is pending again and w's outputs are
        // locked behind it.
        assert_eq!(state.get_mempool_overview(10).pending_count, 1);
        assert_eq!(
            state.get_mempool_overview(10).top[0].0,
            tx.txid_hex()
        );
    }

    #[test]
    fn test_reorg_below_checkpoint_rejected() {
        let dir = tempdir().unwrap();
        let mut params = ConsensusParams::regtest();
        params.checkpoint_interval = 2;
        let state = ChainState::open(params, dir.path()).unwrap();
        let miner = wallet();
        let rival = wallet();

        for _ in 0..3 {
            fund_wallet(&state, &miner);
        }
        // Height 2 is checkpointed and final.
        let fork_parent = state.get_block_at(1).unwrap();
        let c2 = build_block_on(&state, &fork_parent, &rival.address, Vec::new(), 64);
        let err = state.submit_block(c2).unwrap_err();
        assert!(matches!(err, CoreError::ReorgRejected(_)));
        assert_eq!(state.get_tip().height, 3);
    }

    #[test]
    fn test_apply_then_disconnect_restores_state() {
        let dir = tempdir().unwrap();
        let state = open_state(dir.path());
        let w = wallet();
        fund_wallet(&state, &w);

        let recipient = wallet();
        let tx = transfer_all(
            &state,
            &w,
            &recipient.address,
            Amount::from_coins(5).unwrap(),
            Amount::from_decimal_str("0.1").unwrap(),
            0,
            false,
        );
        let block = build_block(&state, &w.address, vec![tx], 1);

        let mut inner = state.inner.write();
        let utxos_before = inner.utxos.clone();
        let nonces_before = inner.nonces.clone();

        inner.validate_and_apply(block.clone(), state.params(), false).unwrap();
        assert_ne!(inner.utxos, utxos_before);

        let undo = inner.undo.pop().unwrap();
        reorg::disconnect_block(&mut inner, &block, &undo).unwrap();
        inner.chain.pop();
        inner.work.pop();
        inner.hash_index.remove(&block.hash());

        assert_eq!(inner.utxos, utxos_before);
        assert_eq!(inner.nonces, nonces_before);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempdir().unwrap();
        let tip_before;
        let miner = wallet();
        {
            let state = open_state(dir.path());
            for _ in 0..3 {
                fund_wallet(&state, &miner);
            }
            tip_before = state.get_tip();
        }

        let state = open_state(dir.path());
        let tip_after = state.get_tip();
        assert_eq!(tip_after, tip_before);
        assert_eq!(
            state.get_balance(&miner.address),
            Amount::from_coins(36).unwrap()
        );
        let (_, total) = state.get_transaction_history(&miner.address, 10, 0).unwrap();
        assert_eq!(total, 3);
    }

    #[test]
    fn test_shutdown_persists_mempool() {
        let dir = tempdir().unwrap();
        let w = wallet();
        let recipient = wallet();
        let txid;
        {
            let state = open_state(dir.path());
            fund_wallet(&state, &w);
            let tx = transfer_all(
                &state,
                &w,
                &recipient.address,
                Amount::from_coins(5).unwrap(),
                Amount::from_decimal_str("0.1").unwrap(),
                0,
                false,
            );
            txid = tx.txid_hex();
            state.submit_transaction(tx).unwrap();
            state.shutdown().unwrap();
        }

        let state = open_state(dir.path());
        let overview = state.get_mempool_overview(10);
        assert_eq!(overview.pending_count, 1);
        assert_eq!(overview.top[0].0, txid);
    }

    #[test]
    fn test_invalid_pow_rejected() {
        let dir = tempdir().unwrap();
        let state = open_state(dir.path());
        let miner = wallet();

        // Difficulty high enough that an unmined nonce will not pass.
        let mut block = build_block(&state, &miner.address, Vec::new(), 1);
        block.header.difficulty = u64::MAX;
        let err = state.submit_block(block).unwrap_err();
        assert!(matches!(err, CoreError::InvalidPoW(_)));
    }

    #[test]
    fn test_merkle_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let state = open_state(dir.path());
        let miner = wallet();

        let mut block = build_block(&state, &miner.address, Vec::new(), 1);
        block.header.merkle_root = crate::crypto::sha256(b"wrong");
        pow::mine(&mut block.header);
        let err = state.submit_block(block).unwrap_err();
        assert_eq!(err, CoreError::MerkleMismatch);
    }

    #[test]
    fn test_mempool_overview_reports_normal_when_idle() {
        let dir = tempdir().unwrap();
        let state = open_state(dir.path());
        let overview = state.get_mempool_overview(5);
        assert_eq!(overview.pending_count, 0);
        assert_eq!(overview.pressure, PressureState::Normal);
        assert!(state.estimate_fee(250) > Amount::ZERO);
    }
}
