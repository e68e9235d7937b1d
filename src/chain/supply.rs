//! Block reward schedule and supply cap
//!
//! Rewards halve on a fixed interval and are clamped so the genesis
//! allocation plus every reward ever paid can never exceed the hard
//! cap. Once the halved reward drops below dust it is zero forever.

use crate::amount::{Amount, MAX_SUPPLY};
use crate::config::ConsensusParams;

/// Rewards at or below this many base units round to zero.
const DUST_FLOOR: u64 = 1;

/// Reward for the block at `height` given the supply already issued.
///
/// The nominal schedule halves every `halving_interval` blocks; the
/// remaining room under the cap clamps it further, so the final blocks
/// before the cap pay out partial rewards and everything after pays
/// nothing.
pub fn block_reward(height: u64, current_supply: Amount, params: &ConsensusParams) -> Amount {
    let halvings = height / params.halving_interval;
    if halvings >= 64 {
        return Amount::ZERO;
    }
    let nominal = params.initial_reward.base_units() >> halvings;
    if nominal <= DUST_FLOOR {
        return Amount::ZERO;
    }
    let remaining = MAX_SUPPLY.saturating_sub(current_supply.base_units());
    Amount::from_base_units(nominal.min(remaining)).unwrap_or(Amount::ZERO)
}
