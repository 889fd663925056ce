// Difficulty retargeting

use crate::config::ChainParams;
use crate::consensus::pow::Target;
use primitive_types::U256;

/// Whether a block at `height` starts a new difficulty period
pub fn is_retarget_height(params: &ChainParams, height: u64) -> bool {
    height > 0 && height % params.retarget_interval as u64 == 0
}

/// Height of the block that opens the period ending at `last_height`
pub fn interval_start_height(params: &ChainParams, last_height: u64) -> u64 {
    last_height.saturating_sub(params.retarget_interval as u64 - 1)
}

/// Expected seconds for one full interval
pub fn expected_timespan(params: &ChainParams) -> u64 {
    params.retarget_interval as u64 * params.target_block_time as u64
}

/// Compute the bits for the block after a completed interval.
///
/// `first_time` and `last_time` are the timestamps of the first and last block of
/// the interval. The elapsed time is clamped to
/// [expected / factor, expected * factor] and the result never exceeds the limit.
pub fn retarget(params: &ChainParams, old_bits: u32, first_time: u32, last_time: u32) -> u32 {
    let expected = expected_timespan(params);
    let factor = params.max_adjustment_factor as u64;
    let actual = (last_time as i64 - first_time as i64)
        .clamp((expected / factor) as i64, (expected * factor) as i64) as u64;

    let limit = match Target::from_bits(params.pow_limit_bits).to_u256() {
        Ok(limit) => limit,
        Err(_) => return old_bits,
    };
    let old = match Target::from_bits(old_bits).to_u256() {
        Ok(old) => old,
        Err(_) => return params.pow_limit_bits,
    };

    let new = old
        .checked_mul(U256::from(actual))
        .map(|scaled| scaled / U256::from(expected))
        .unwrap_or(limit)
        .min(limit);

    let bits = Target::from_u256(new).bits;
    log::debug!(
        "Difficulty retarget: {:08x} -> {:08x} (actual {}s, expected {}s)",
        old_bits, bits, actual, expected
    );
    bits
}
