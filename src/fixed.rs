//! Deterministic Fixed-Point Primitives
//!
//! The single place where this crate manufactures its bit-identical,
//! cross-platform arithmetic guarantee. Every primitive here is pure
//! integer arithmetic: no hardware floating point, no implementation-defined
//! right shift on signed values, no reliance on two's-complement wraparound
//! for overflow detection. Higher-level modules (the analyzer, the
//! calibrator, the verifier) quote bit-identity; this module is the only
//! place that guarantee is actually produced, so it carries its own
//! exhaustive bit-vector test suite.
//!
//! Every operation that can produce an out-of-range result signals through
//! [`FaultFlags`](crate::fault::FaultFlags) rather than failing outright —
//! callers decide whether a fault is fatal at a phase boundary, per the
//! crate's error-handling split.

#![forbid(unsafe_code)]

use crate::fault::{Fault, FaultFlags};

/// A scale exponent `s` such that the scale factor is `2^s`, `s ∈ [0, 31]`.
pub type ScaleExp = i8;

/// Errors produced by the fixed-point primitives' `Result`-returning API.
#[derive(Debug, thiserror::Error)]
pub enum FixedError {
    /// A shift count exceeded the representable range for the operation.
    #[error("shift count {0} out of range (max 62)")]
    ShiftOutOfRange(usize),
}

/// Saturate a 64-bit value into the `i32` range, flagging overflow/underflow.
#[inline]
pub fn clamp32(x: i64, faults: &mut FaultFlags) -> i32 {
    if x > i32::MAX as i64 {
        faults.set(Fault::Overflow);
        i32::MAX
    } else if x < i32::MIN as i64 {
        faults.set(Fault::Underflow);
        i32::MIN
    } else {
        x as i32
    }
}

/// Saturating 64-bit addition. The overflow test happens before the
/// arithmetic so no undefined/implementation-defined wraparound is ever
/// relied upon.
#[inline]
pub fn add64_sat(a: i64, b: i64, faults: &mut FaultFlags) -> i64 {
    if b > 0 && a > i64::MAX - b {
        faults.set(Fault::Overflow);
        i64::MAX
    } else if b < 0 && a < i64::MIN - b {
        faults.set(Fault::Underflow);
        i64::MIN
    } else {
        a + b
    }
}

/// Saturating 64-bit subtraction, symmetric to [`add64_sat`].
#[inline]
pub fn sub64_sat(a: i64, b: i64, faults: &mut FaultFlags) -> i64 {
    if b < 0 && a > i64::MAX + b {
        faults.set(Fault::Overflow);
        i64::MAX
    } else if b > 0 && a < i64::MIN + b {
        faults.set(Fault::Underflow);
        i64::MIN
    } else {
        a - b
    }
}

/// Portable arithmetic right shift on a signed 32-bit value.
///
/// Rust's `>>` on `i32` is already a defined arithmetic shift (unlike C),
/// so this exists purely to give the operation a name that mirrors the
/// primitive set it sits beside and to make call sites self-documenting.
#[inline]
pub fn sra32(x: i32, shift: u32) -> i32 {
    x >> shift.min(31)
}

/// Portable arithmetic right shift on a signed 64-bit value.
#[inline]
pub fn sra64(x: i64, shift: u32) -> i64 {
    x >> shift.min(63)
}

/// Round-to-nearest-even right shift, `Result`-returning.
///
/// Computes `x / 2^shift` rounded half-to-even, saturated into `i32`.
/// `shift == 0` degrades to a plain clamp; `shift > 62` is out of range
/// (the original's undefined-shift guard) and reports an overflow fault
/// with a `0` result rather than erroring, matching the source's choice
/// to keep this primitive infallible.
#[inline]
pub fn round_shift_rne_r(x: i64, shift: u32, faults: &mut FaultFlags) -> Result<i32, FixedError> {
    if shift > 62 {
        return Err(FixedError::ShiftOutOfRange(shift as usize));
    }
    if shift == 0 {
        return Ok(clamp32(x, faults));
    }
    let divisor: i64 = 1i64 << shift;
    let half = divisor / 2;
    let mut quot = x / divisor;
    let remainder = x % divisor;

    if remainder > half {
        quot += 1;
    } else if remainder < -half {
        quot -= 1;
    } else if remainder == half {
        quot += quot & 1;
    } else if remainder == -half {
        quot -= quot & 1;
    }
    Ok(clamp32(quot, faults))
}

/// Back-compat wrapper: out-of-range shifts flag overflow and return 0
/// rather than panicking, matching the original's infallible primitive.
#[inline]
pub fn round_shift_rne(x: i64, shift: u32, faults: &mut FaultFlags) -> i32 {
    match round_shift_rne_r(x, shift, faults) {
        Ok(v) => v,
        Err(FixedError::ShiftOutOfRange(_)) => {
            faults.set(Fault::Overflow);
            0
        }
    }
}

/// Q-format multiply: `mul_q(a, b) = RNE_shift(a * b, frac_bits)`.
///
/// The intermediate product is computed in 64 bits so no precision is
/// lost before rounding.
#[inline]
pub fn mul_q(a: i32, b: i32, frac_bits: u32, faults: &mut FaultFlags) -> i32 {
    let wide = (a as i64) * (b as i64);
    round_shift_rne(wide, frac_bits, faults)
}

/// Q-format divide with round-to-nearest-even remainder handling.
///
/// Division by zero sets the fatal [`Fault::DivZero`] flag and returns 0.
#[inline]
pub fn div_q(a: i32, b: i32, frac_bits: u32, faults: &mut FaultFlags) -> i32 {
    if b == 0 {
        faults.set(Fault::DivZero);
        return 0;
    }
    let wide_a = (a as i64) << frac_bits;
    let b64 = b as i64;
    let mut quot = wide_a / b64;
    let rem = wide_a % b64;
    let half_b = b64.abs() / 2;
    let abs_rem = rem.abs();
    let sign = if quot >= 0 { 1 } else { -1 };

    if abs_rem > half_b {
        quot += sign;
    } else if abs_rem == half_b && quot & 1 != 0 {
        quot += sign;
    }
    clamp32(quot, faults)
}

/// Multiply-accumulate: `*acc += a * b`, saturating.
#[inline]
pub fn mac_q(acc: &mut i64, a: i32, b: i32, faults: &mut FaultFlags) {
    let product = (a as i64) * (b as i64);
    *acc = add64_sat(*acc, product, faults);
}

/// Finalize an accumulator into the Q16.16 output domain via a saturating
/// RNE right shift by 16 bits.
#[inline]
pub fn acc_to_q16(acc: i64, faults: &mut FaultFlags) -> i32 {
    round_shift_rne(acc, 16, faults)
}

/// Proof that a dot product of length `n` over values bounded by
/// `max_weight_mag` and `max_input_mag` cannot overflow a signed 64-bit
/// accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowProof {
    /// Largest magnitude a weight code can take.
    pub max_weight_mag: u64,
    /// Largest magnitude an input code can take.
    pub max_input_mag: u64,
    /// Length of the dot product (fan-in).
    pub dot_product_len: u64,
    /// `2^63 - n * |w|_max * |x|_max`, clamped at zero. Retained as a
    /// sentinel of `2^63` when any factor is zero ("trivially safe") for
    /// wire compatibility with the original implementation — see the
    /// crate's design notes for why this is documented, not fixed.
    pub safety_margin: u64,
    /// Whether the worst-case product is below `2^63`.
    pub is_safe: bool,
}

/// Compute an [`OverflowProof`] for a dot product of length `n`.
///
/// Each multiplication stage is individually overflow-checked against
/// `u64::MAX` before it happens, so the check itself never wraps.
pub fn compute_overflow_proof(n: u64, max_weight_mag: u64, max_input_mag: u64) -> OverflowProof {
    const LIMIT: u64 = 1u64 << 63;

    if n == 0 || max_weight_mag == 0 || max_input_mag == 0 {
        return OverflowProof {
            max_weight_mag,
            max_input_mag,
            dot_product_len: n,
            safety_margin: LIMIT,
            is_safe: true,
        };
    }

    let nw = match n.checked_mul(max_weight_mag) {
        Some(v) => v,
        None => {
            return OverflowProof {
                max_weight_mag,
                max_input_mag,
                dot_product_len: n,
                safety_margin: 0,
                is_safe: false,
            }
        }
    };
    let product = match nw.checked_mul(max_input_mag) {
        Some(v) => v,
        None => {
            return OverflowProof {
                max_weight_mag,
                max_input_mag,
                dot_product_len: n,
                safety_margin: 0,
                is_safe: false,
            }
        }
    };

    if product < LIMIT {
        OverflowProof {
            max_weight_mag,
            max_input_mag,
            dot_product_len: n,
            safety_margin: LIMIT - product,
            is_safe: true,
        }
    } else {
        OverflowProof {
            max_weight_mag,
            max_input_mag,
            dot_product_len: n,
            safety_margin: 0,
            is_safe: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rne_bit_vectors() {
        let mut f = FaultFlags::new();
        // 1.5 -> 2 (round to even)
        assert_eq!(round_shift_rne(0x00018000, 16, &mut f), 2);
        // 2.5 -> 2 (round to even)
        assert_eq!(round_shift_rne(0x00028000, 16, &mut f), 2);
        // 3.5 -> 4 (round to even)
        assert_eq!(round_shift_rne(0x00038000, 16, &mut f), 4);
        assert!(!f.has_fatal());
    }

    #[test]
    fn rne_negative_ties() {
        let mut f = FaultFlags::new();
        assert_eq!(round_shift_rne(-0x00018000, 16, &mut f), -2);
        assert_eq!(round_shift_rne(-0x00028000, 16, &mut f), -2);
    }

    #[test]
    fn shift_zero_is_plain_clamp() {
        let mut f = FaultFlags::new();
        assert_eq!(round_shift_rne(42, 0, &mut f), 42);
    }

    #[test]
    fn shift_out_of_range_flags_overflow() {
        let mut f = FaultFlags::new();
        assert_eq!(round_shift_rne(1, 63, &mut f), 0);
        assert!(f.has(Fault::Overflow));
    }

    #[test]
    fn clamp_saturates_both_directions() {
        let mut f = FaultFlags::new();
        assert_eq!(clamp32(i64::from(i32::MAX) + 1, &mut f), i32::MAX);
        assert!(f.has(Fault::Overflow));
        let mut f = FaultFlags::new();
        assert_eq!(clamp32(i64::from(i32::MIN) - 1, &mut f), i32::MIN);
        assert!(f.has(Fault::Underflow));
    }

    #[test]
    fn add_sub_saturate_without_wrap() {
        let mut f = FaultFlags::new();
        assert_eq!(add64_sat(i64::MAX, 1, &mut f), i64::MAX);
        assert!(f.has(Fault::Overflow));
        let mut f = FaultFlags::new();
        assert_eq!(sub64_sat(i64::MIN, 1, &mut f), i64::MIN);
        assert!(f.has(Fault::Underflow));
    }

    #[test]
    fn mul_q_is_commutative() {
        let mut f = FaultFlags::new();
        let one = 1i32 << 16;
        assert_eq!(mul_q(3 << 16, one, 16, &mut f), 3 << 16);
        assert_eq!(mul_q(one, 3 << 16, 16, &mut f), 3 << 16);
    }

    #[test]
    fn div_by_zero_is_fatal() {
        let mut f = FaultFlags::new();
        assert_eq!(div_q(1 << 16, 0, 16, &mut f), 0);
        assert!(f.has_fatal());
    }

    #[test]
    fn overflow_proof_boundary() {
        let p = compute_overflow_proof(1 << 20, 1 << 21, 1 << 21);
        assert!(p.is_safe);
        assert_eq!(p.safety_margin, 1u64 << 62);

        let p = compute_overflow_proof(2, 1u64 << 31, 1u64 << 31);
        assert!(!p.is_safe);
    }

    #[test]
    fn overflow_proof_zero_factor_is_trivially_safe() {
        let p = compute_overflow_proof(0, 5, 5);
        assert!(p.is_safe);
        assert_eq!(p.safety_margin, 1u64 << 63);
    }

    #[test]
    fn mac_accumulates_with_saturation() {
        let mut acc = 0i64;
        let mut f = FaultFlags::new();
        mac_q(&mut acc, 2, 3, &mut f);
        assert_eq!(acc, 6);
        assert!(!f.has_fatal());
    }
}
