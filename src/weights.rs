//! Probability engine: maps a staker record to its integer sampling weight.
//!
//! `w = floor(amount / WAN_UNIT) * floor(round4(exp(-t)) * 1024) * L` where
//! `t` is the remaining-lock ratio. Every step is integer arithmetic so all
//! nodes derive bit-identical weights; no float ever enters the pipeline.

use malachite::Natural;
use malachite::base::num::arithmetic::traits::DivRem;

use crate::params::WAN_UNIT;
use crate::types::StakerInfo;

/// Fixed-point scale of the Taylor evaluation.
const EXP_SCALE: u128 = 10_000_000_000_000_000; // 10^16

/// Magnification applied to the rounded exponential.
const ACCURACY: u64 = 1024;

/// Remaining-lock ratios are quantized to 32 fractional bits before the
/// exponential is evaluated.
const T_FRACTION_BITS: u32 = 32;

/// `exp(-t)` at [`EXP_SCALE`] fixed point for `t = t_bits / 2^32`, `t` in
/// `[0, 1]`.
///
/// Alternating Taylor series with truncating division; each term is exact to
/// one unit in the last place, and the series is cut far below the 4-decimal
/// rounding granularity applied afterwards.
fn exp_neg_fixed(t_bits: u64) -> u128 {
    debug_assert!(t_bits <= 1u64 << T_FRACTION_BITS);
    let mut term: u128 = EXP_SCALE;
    let mut sum: i128 = EXP_SCALE as i128;
    let mut n: u128 = 1;
    loop {
        term = (term * t_bits as u128) >> T_FRACTION_BITS;
        term /= n;
        if term == 0 {
            break;
        }
        if n % 2 == 1 {
            sum -= term as i128;
        } else {
            sum += term as i128;
        }
        n += 1;
    }
    sum as u128
}

/// Rounds an [`EXP_SCALE`] fixed-point value to 4 decimals, half to even.
fn round_half_even_4(value: u128) -> u64 {
    const STEP: u128 = EXP_SCALE / 10_000; // 10^12
    let quotient = value / STEP;
    let remainder = value % STEP;
    let half = STEP / 2;
    let round_up = remainder > half || (remainder == half && quotient % 2 == 1);
    (quotient + u128::from(round_up)) as u64
}

/// `floor(round4(exp(-remaining / lock)) * 1024)`.
///
/// Exposed separately so the boundary vectors can be pinned without a full
/// staker record.
pub fn lock_ratio_factor(remaining: u64, lock_epochs: u64) -> u64 {
    debug_assert!(remaining <= lock_epochs && lock_epochs > 0);
    let t_bits = (((remaining as u128) << T_FRACTION_BITS) / lock_epochs as u128) as u64;
    let rounded = round_half_even_4(exp_neg_fixed(t_bits));
    rounded * ACCURACY / 10_000
}

/// Weight contributed by `amount` under the lock window `(lock_epochs,
/// staking_epoch)` at `epoch`. Zero when the amount is zero or the lock has
/// run out.
pub fn amount_weight(
    amount: &Natural,
    lock_epochs: u64,
    staking_epoch: u64,
    epoch: u64,
) -> Natural {
    let zero = Natural::from(0u32);
    if lock_epochs == 0 || *amount == zero {
        return zero;
    }
    let elapsed = epoch.saturating_sub(staking_epoch);
    let remaining = lock_epochs.saturating_sub(elapsed);
    if remaining == 0 {
        return zero;
    }
    let unit = Natural::from(WAN_UNIT);
    let (units, _) = amount.clone().div_rem(&unit);
    if units == zero {
        return zero;
    }
    let factor = lock_ratio_factor(remaining, lock_epochs);
    units * Natural::from(factor) * Natural::from(lock_epochs)
}

/// Sampling weight of a staker at `epoch`; zero weight means excluded.
pub fn staker_weight(staker: &StakerInfo, epoch: u64) -> Natural {
    amount_weight(
        staker.amount.as_natural(),
        staker.lock_epochs,
        staker.staking_epoch,
        epoch,
    )
}
