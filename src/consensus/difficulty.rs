// Difficulty retargeting
//
// Every `retarget_interval` blocks the target is scaled by the ratio of the
// time the last interval actually took to the time it should have taken.
// The ratio is clamped to [1/4, 4] and the result never exceeds the pow limit.

use crate::config::ConsensusParams;
use crate::consensus::pow::Target;
use num_bigint::BigUint;

/// Whether the child of a block at `parent_height` gets a new target
pub fn is_retarget_height(params: &ConsensusParams, parent_height: u64) -> bool {
    params.retarget_interval > 0
        && parent_height > 0
        && parent_height % params.retarget_interval == 0
}

/// Scale `current` by `actual / expected` seconds, clamped, capped at `limit`
pub fn retarget(current: &Target, actual_secs: u64, expected_secs: u64, limit: &Target) -> Target {
    let expected = expected_secs.max(1);
    let actual = actual_secs.clamp(expected / 4, expected.saturating_mul(4)).max(1);

    let scaled = current.value() * BigUint::from(actual) / BigUint::from(expected);
    let next = Target::from_value(scaled);
    // Round-trip through compact bits so the header can carry it exactly
    let next = Target::from_bits(next.to_bits()).unwrap_or_else(|| limit.clone());

    if next.is_harder_or_equal(limit) { next } else { limit.clone() }
}

/// Target required for the child of a block.
///
/// `window_start_timestamp` is the timestamp of the ancestor at
/// `parent_height - retarget_interval`; it is only read at retarget heights.
pub fn next_target(
    params: &ConsensusParams,
    parent_height: u64,
    parent_target: &Target,
    parent_timestamp: u64,
    window_start_timestamp: Option<u64>,
) -> Target {
    if !is_retarget_height(params, parent_height) {
        return parent_target.clone();
    }
    let Some(start) = window_start_timestamp else {
        return parent_target.clone();
    };

    let limit = pow_limit(params);
    let actual = parent_timestamp.saturating_sub(start);
    let expected = params.retarget_interval * params.target_spacing;
    let next = retarget(parent_target, actual, expected, &limit);

    log::debug!(
        "Retarget at height {}: {}s for {} blocks (expected {}s), bits {:#010x} -> {:#010x}",
        parent_height + 1,
        actual,
        params.retarget_interval,
        expected,
        parent_target.to_bits(),
        next.to_bits()
    );
    next
}

pub fn pow_limit(params: &ConsensusParams) -> Target {
    Target::from_bits(params.pow_limit_bits).unwrap_or_else(|| Target::from_value(BigUint::from(1u8) << 255u32))
}
