//! Transcendental helpers for the x87 front end.
//!
//! These route through host `f64` after an exact 80-to-64-bit rounding,
//! which
//! concedes the last few ulps of extended precision. The error is well under
//! the 1-ulp-of-double envelope legacy guests tolerate; exactness-sensitive
//! paths (arithmetic, remainder, rounding) never come through here.

use crate::convert::{from_f64, to_f64_lossy};
use crate::{propagate_nan, Float80, Status, FLAG_INEXACT, FLAG_INVALID};

#[inline]
fn repack(st: &mut Status, v: f64) -> Float80 {
    let mut scratch = Status::new();
    let r = from_f64(&mut scratch, v.to_bits());
    st.raise(FLAG_INEXACT);
    r
}

fn guard_unary(st: &mut Status, a: Float80) -> Option<Float80> {
    if a.is_nan() || a.is_unsupported() {
        return Some(propagate_nan(st, a, a));
    }
    None
}

/// F2XM1: `2^a - 1` for `a` in [-1, 1]; out-of-range input is undefined and
/// comes back unmodified through the f64 path like the hardware's "no-op"
/// tolerance.
pub fn f2xm1(st: &mut Status, a: Float80) -> Float80 {
    if let Some(n) = guard_unary(st, a) {
        return n;
    }
    let x = to_f64_lossy(a);
    repack(st, (x * core::f64::consts::LN_2).exp_m1())
}

/// FYL2X: `b * log2(a)`.
pub fn yl2x(st: &mut Status, a: Float80, b: Float80) -> Float80 {
    if a.is_nan() || b.is_nan() || a.is_unsupported() || b.is_unsupported() {
        return propagate_nan(st, a, b);
    }
    if a.sign() && !a.is_zero() {
        st.raise(FLAG_INVALID);
        return Float80::INDEFINITE;
    }
    if a.is_zero() {
        if b.is_zero() {
            st.raise(FLAG_INVALID);
            return Float80::INDEFINITE;
        }
        st.raise(crate::FLAG_DIV_ZERO);
        return Float80::infinity(!b.sign());
    }
    let x = to_f64_lossy(a);
    let y = to_f64_lossy(b);
    repack(st, y * x.log2())
}

/// FYL2XP1: `b * log2(a + 1)`, accurate near zero.
pub fn yl2xp1(st: &mut Status, a: Float80, b: Float80) -> Float80 {
    if a.is_nan() || b.is_nan() || a.is_unsupported() || b.is_unsupported() {
        return propagate_nan(st, a, b);
    }
    let x = to_f64_lossy(a);
    let y = to_f64_lossy(b);
    repack(st, y * x.ln_1p() / core::f64::consts::LN_2)
}

/// FPATAN: `atan(b / a)` with quadrant correction.
pub fn patan(st: &mut Status, a: Float80, b: Float80) -> Float80 {
    if a.is_nan() || b.is_nan() || a.is_unsupported() || b.is_unsupported() {
        return propagate_nan(st, a, b);
    }
    let x = to_f64_lossy(a);
    let y = to_f64_lossy(b);
    repack(st, y.atan2(x))
}

/// Trig operand range check: |a| must be below 2^63 or C2 is set and the
/// operand is left untouched.
#[inline]
pub fn trig_in_range(a: Float80) -> bool {
    a.is_zero() || (a.exp() as i32) < 0x3FFF + 63
}

pub fn sin(st: &mut Status, a: Float80) -> Float80 {
    if let Some(n) = guard_unary(st, a) {
        return n;
    }
    if a.is_inf() {
        st.raise(FLAG_INVALID);
        return Float80::INDEFINITE;
    }
    repack(st, to_f64_lossy(a).sin())
}

pub fn cos(st: &mut Status, a: Float80) -> Float80 {
    if let Some(n) = guard_unary(st, a) {
        return n;
    }
    if a.is_inf() {
        st.raise(FLAG_INVALID);
        return Float80::INDEFINITE;
    }
    repack(st, to_f64_lossy(a).cos())
}

/// FPTAN partial tangent: returns tan(a); the front end pushes the 1.0.
pub fn tan(st: &mut Status, a: Float80) -> Float80 {
    if let Some(n) = guard_unary(st, a) {
        return n;
    }
    if a.is_inf() {
        st.raise(FLAG_INVALID);
        return Float80::INDEFINITE;
    }
    repack(st, to_f64_lossy(a).tan())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::{from_i64, to_i64};
    use crate::Status;

    #[test]
    fn yl2x_of_pow2_is_exact_enough() {
        let mut st = Status::new();
        let r = yl2x(&mut st, from_i64(8), from_i64(2));
        assert_eq!(to_i64(&mut st, r), 6); // 2 * log2(8)
    }

    #[test]
    fn patan_quadrants() {
        let mut st = Status::new();
        let r = patan(&mut st, from_i64(1), from_i64(1));
        let v = crate::convert::to_f64_lossy(r);
        assert!((v - core::f64::consts::FRAC_PI_4).abs() < 1e-15);
    }

    #[test]
    fn trig_range_gate() {
        assert!(trig_in_range(from_i64(1000)));
        let huge = Float80::from_parts(false, 0x3FFF + 64, 0x8000_0000_0000_0000);
        assert!(!trig_in_range(huge));
    }
}
