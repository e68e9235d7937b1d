//! Proof of work
//!
//! Difficulty D maps to the integer target 2^256 / D; a header proves
//! work when its hash, read as a 256-bit big-endian integer, is
//! strictly below the target. Hashes are never compared as hex-string
//! prefixes: the prefix test accepts hashes whose high bits are nonzero
//! inside the target's leading nibble.

use primitive_types::{U256, U512};

use crate::block::header::BlockHeader;
use crate::config::ConsensusParams;

/// 2^256 as a 512-bit value, the dividend for target math.
fn two_pow_256() -> U512 {
    U512::one() << 256
}

/// Integer target for a difficulty, or None when the difficulty is
/// zero (malformed). Difficulty 1 yields a target above every hash.
pub fn target_for_difficulty(difficulty: u64) -> Option<U512> {
    if difficulty == 0 {
        return None;
    }
    Some(two_pow_256() / U512::from(difficulty))
}

/// Whether `hash` satisfies proof of work at `difficulty`.
///
/// Strict inequality: a hash exactly at the target fails.
pub fn meets_target(hash: &[u8; 32], difficulty: u64) -> bool {
    let Some(target) = target_for_difficulty(difficulty) else {
        return false;
    };
    let hash_int = U512::from(U256::from_big_endian(hash));
    hash_int < target
}

/// Work contributed by one block: 2^256 / (target + 1), approximately
/// the difficulty. Summed over ancestors it orders competing chains.
pub fn block_work(difficulty: u64) -> U256 {
    let Some(target) = target_for_difficulty(difficulty) else {
        return U256::zero();
    };
    let work = two_pow_256() / (target + U512::one());
    // The quotient is at most the difficulty, so the low 256 bits hold it.
    let limbs = work.0;
    U256([limbs[0], limbs[1], limbs[2], limbs[3]])
}

/// Difficulty for the block after `headers.last()`.
///
/// Every `retarget_interval` blocks the difficulty is rescaled so the
/// median of the last interval's block spacings approaches the target
/// block time, clamped to 4x in either direction per retarget and
/// floored at 1.
pub fn next_difficulty(headers: &[BlockHeader], params: &ConsensusParams) -> u64 {
    let Some(tip) = headers.last() else {
        return 1;
    };
    let current = tip.difficulty.max(1);
    let next_height = tip.index + 1;
    if next_height % params.retarget_interval != 0 {
        return current;
    }

    let window = params.retarget_interval as usize;
    if headers.len() < window + 1 {
        return current;
    }
    let recent = &headers[headers.len() - (window + 1)..];
    let mut intervals: Vec<u64> = recent
        .windows(2)
        .map(|pair| pair[1].timestamp.saturating_sub(pair[0].timestamp))
        .collect();
    intervals.sort_unstable();
    let median = intervals[intervals.len() / 2].max(1);

    let target = params.target_block_time_secs;
    // Scale as current * target / median in 128-bit space, then clamp.
    let scaled = (current as u128 * target as u128 / median as u128) as u64;
    let upper = current.saturating_mul(params.retarget_clamp);
    let lower = (current / params.retarget_clamp).max(1);
    scaled.clamp(lower, upper)
}

/// Search nonces until the header satisfies its own difficulty.
///
/// CPU-bound and unbounded; callers pick difficulties they can afford.
pub fn mine(header: &mut BlockHeader) {
    while !meets_target(&header.hash(), header.difficulty) {
        header.nonce = header.nonce.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::header::HEADER_VERSION;
    use crate::crypto::sha256;

    fn hash_from_hex(s: &str) -> [u8; 32] {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    #[test]
    fn test_difficulty_one_accepts_everything() {
        assert!(meets_target(&[0xff; 32], 1));
        assert!(meets_target(&[0x00; 32], 1));
    }

    #[test]
    fn test_zero_difficulty_rejects_everything() {
        assert!(!meets_target(&[0x00; 32], 0));
        assert!(target_for_difficulty(0).is_none());
    }

    #[test]
    fn test_numeric_not_prefix_comparison() {
        // Difficulty 4: target is exactly 2^254.
        let below = hash_from_hex(&format!("0{}", "f".repeat(63)));
        let boundary = hash_from_hex(&format!("4{}", "0".repeat(63)));
        let just_under = hash_from_hex(&format!("3{}", "f".repeat(63)));

        // 0x0FFF..F has no leading "0000" prefix yet is far below 2^254.
        assert!(meets_target(&below, 4));
        // 0x4000..0 equals the target and must fail the strict test. A
        // string-prefix check would wrongly accept it.
        assert!(!meets_target(&boundary, 4));
        assert!(meets_target(&just_under, 4));
    }

    #[test]
    fn test_difficulty_two_boundary() {
        // Target 2^255: 0x7FFF..F passes, 0x8000..0 fails.
        assert!(meets_target(&hash_from_hex(&format!("7{}", "f".repeat(63))), 2));
        assert!(!meets_target(&hash_from_hex(&format!("8{}", "0".repeat(63))), 2));
    }

    #[test]
    fn test_block_work_tracks_difficulty() {
        assert_eq!(block_work(1), U256::from(1u64));
        assert_eq!(block_work(4), U256::from(4u64));
        assert_eq!(block_work(1_000_000), U256::from(1_000_000u64));
        assert_eq!(block_work(0), U256::zero());
    }

    fn header_at(index: u64, timestamp: u64, difficulty: u64) -> BlockHeader {
        BlockHeader {
            index,
            previous_hash: sha256(&index.to_be_bytes()),
            merkle_root: [0u8; 32],
            timestamp,
            difficulty,
            nonce: 0,
            version: HEADER_VERSION,
        }
    }

    fn chain_with_spacing(len: u64, spacing: u64, difficulty: u64) -> Vec<BlockHeader> {
        (0..len)
            .map(|i| header_at(i, 1_700_000_000 + i * spacing, difficulty))
            .collect()
    }

    #[test]
    fn test_retarget_only_at_interval() {
        let params = ConsensusParams::mainnet();
        // Tip at index 8: next height 9 is mid-interval, no change.
        let headers = chain_with_spacing(9, 10, 8);
        assert_eq!(next_difficulty(&headers, &params), 8);
    }

    #[test]
    fn test_retarget_raises_on_fast_blocks() {
        let params = ConsensusParams::mainnet();
        // Blocks at 30s against a 120s target: difficulty should rise 4x.
        let headers = chain_with_spacing(20, 30, 8);
        assert_eq!(headers.last().unwrap().index, 19);
        assert_eq!(next_difficulty(&headers, &params), 32);
    }

    #[test]
    fn test_retarget_clamped_both_directions() {
        let params = ConsensusParams::mainnet();
        // 1-second spacing wants a 120x raise; clamp holds it to 4x.
        let headers = chain_with_spacing(20, 1, 8);
        assert_eq!(next_difficulty(&headers, &params), 32);

        // Hour-long gaps want a collapse; clamp holds it to a quarter.
        let headers = chain_with_spacing(20, 3_600, 8);
        assert_eq!(next_difficulty(&headers, &params), 2);
    }

    #[test]
    fn test_retarget_never_below_one() {
        let params = ConsensusParams::mainnet();
        let headers = chain_with_spacing(20, 3_600, 1);
        assert_eq!(next_difficulty(&headers, &params), 1);
    }

    #[test]
    fn test_mine_finds_valid_nonce() {
        let mut header = header_at(1, 1_700_000_000, 4);
        mine(&mut header);
        assert!(meets_target(&header.hash(), 4));
    }
}
