//! Consensus parameters
//!
//! Every tunable the engine consults lives here so collaborators can
//! spin up mainnet, testnet, or throwaway test networks from one place.

use serde::{Deserialize, Serialize};

use crate::amount::{Amount, COIN};
use crate::crypto::Network;

/// Default genesis beneficiary on mainnet.
pub const GENESIS_ADDRESS: &str = "XAI6b7c3bb643c795f43e5c461f275e658b56566613";

/// Parameters fixed at network launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusParams {
    pub network: Network,

    /// Desired seconds between blocks.
    pub target_block_time_secs: u64,
    /// Blocks between difficulty retargets.
    pub retarget_interval: u64,
    /// Per-retarget clamp factor, both directions.
    pub retarget_clamp: u64,
    /// Headers may not be further ahead of wall clock than this.
    pub max_future_drift_secs: u64,
    /// Past timestamps a header must exceed the median of.
    pub median_time_window: usize,

    /// Blocks between reward halvings.
    pub halving_interval: u64,
    /// Reward paid at height 1.
    pub initial_reward: Amount,
    /// Coins created in the genesis block.
    pub genesis_allocation: Amount,
    /// Address receiving the genesis allocation.
    pub genesis_address: String,
    /// Fixed genesis timestamp so every node derives the same genesis
    /// hash.
    pub genesis_timestamp: u64,

    /// Upper bound on a block's canonical byte size.
    pub max_block_bytes: usize,
    /// Upper bound on a transaction's canonical byte size.
    pub max_tx_bytes: usize,

    /// Mempool capacity in transactions.
    pub mempool_max_txs: usize,
    /// Mempool capacity in bytes.
    pub mempool_max_bytes: usize,
    /// Age bound used for pressure reporting only; eviction is by rank.
    pub mempool_max_age_secs: u64,
    /// Absolute fee increase a replacement must add.
    pub min_relay_increment: Amount,
    /// Orphan transactions are dropped after this long.
    pub orphan_tx_ttl_secs: u64,

    /// Orphan blocks deeper than this below the tip are pruned.
    pub orphan_block_depth: u64,
    /// Heights at multiples of this get a UTXO checkpoint, which also
    /// bounds reorganization depth.
    pub checkpoint_interval: u64,
}

impl ConsensusParams {
    pub fn mainnet() -> Self {
        Self {
            network: Network::Mainnet,
            target_block_time_secs: 120,
            retarget_interval: 10,
            retarget_clamp: 4,
            max_future_drift_secs: 7_200,
            median_time_window: 11,
            halving_interval: 262_800,
            initial_reward: Amount::from_base_units(12 * COIN).expect("within cap"),
            genesis_allocation: Amount::from_base_units(60_500_000 * COIN).expect("within cap"),
            genesis_address: GENESIS_ADDRESS.to_string(),
            genesis_timestamp: 1_700_000_000,
            max_block_bytes: 4 * 1024 * 1024,
            max_tx_bytes: 100 * 1024,
            mempool_max_txs: 5_000,
            mempool_max_bytes: 4 * 1024 * 1024,
            mempool_max_age_secs: 3_600,
            min_relay_increment: Amount::from_base_units(1_000).expect("within cap"),
            orphan_tx_ttl_secs: 86_400,
            orphan_block_depth: 100,
            checkpoint_interval: 1_000,
        }
    }

    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            genesis_address: format!("T{GENESIS_ADDRESS}"),
            ..Self::mainnet()
        }
    }

    /// Parameters for unit tests: difficulty stays at 1 and checkpoints
    /// stay out of the way unless a test opts in.
    #[cfg(test)]
    pub fn regtest() -> Self {
        Self {
            retarget_interval: 1_000_000,
            checkpoint_interval: 1_000_000,
            ..Self::mainnet()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::MAX_SUPPLY;

    #[test]
    fn test_genesis_is_half_of_cap() {
        let params = ConsensusParams::mainnet();
        assert_eq!(params.genesis_allocation.base_units() * 2, MAX_SUPPLY);
    }

    #[test]
    fn test_halving_interval_is_one_year_of_blocks() {
        let params = ConsensusParams::mainnet();
        let seconds_per_year = 365 * 24 * 60 * 60;
        assert_eq!(
            params.halving_interval * params.target_block_time_secs,
            seconds_per_year
        );
    }
}
