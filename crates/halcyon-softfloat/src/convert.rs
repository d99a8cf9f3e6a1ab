//! Conversions between the 80-bit format and integers / f32 / f64.

use crate::{
    round_pack, shift_right_jam_extra, unpack, Float80, Precision, Rounding, Status, FLAG_INEXACT,
    FLAG_INVALID,
};

pub fn from_i64(v: i64) -> Float80 {
    if v == 0 {
        return Float80::ZERO;
    }
    let sign = v < 0;
    let mag = v.unsigned_abs();
    let shift = mag.leading_zeros();
    Float80::from_parts(sign, (0x403E - shift) as u16, mag << shift)
}

#[inline]
pub fn from_i32(v: i32) -> Float80 {
    from_i64(v as i64)
}

#[inline]
pub fn from_i16(v: i16) -> Float80 {
    from_i64(v as i64)
}

/// Convert to a 64-bit integer using the status rounding mode. Out-of-range
/// values (including NaN) raise #I and return the integer indefinite.
pub fn to_i64(st: &mut Status, a: Float80) -> i64 {
    match to_int_common(st, a, 63) {
        Some(v) => v,
        None => {
            st.raise(FLAG_INVALID);
            i64::MIN
        }
    }
}

pub fn to_i32(st: &mut Status, a: Float80) -> i32 {
    match to_int_common(st, a, 31) {
        Some(v) if v >= i32::MIN as i64 && v <= i32::MAX as i64 => v as i32,
        _ => {
            st.raise(FLAG_INVALID);
            i32::MIN
        }
    }
}

pub fn to_i16(st: &mut Status, a: Float80) -> i16 {
    match to_int_common(st, a, 15) {
        Some(v) if v >= i16::MIN as i64 && v <= i16::MAX as i64 => v as i16,
        _ => {
            st.raise(FLAG_INVALID);
            i16::MIN
        }
    }
}

/// Shared integer conversion: returns `None` when the value cannot round
/// into `bits+1`-bit signed range.
fn to_int_common(st: &mut Status, a: Float80, bits: u32) -> Option<i64> {
    if a.is_nan() || a.is_unsupported() || a.is_inf() {
        return None;
    }
    if a.is_zero() {
        return Some(0);
    }
    let (sign, exp, sig) = unpack(st, a);
    let unbiased = exp - 0x3FFF;
    if unbiased > 63 {
        return None;
    }
    // Integer part, plus the fraction left-aligned so bit 63 is the half.
    let (int_part, frac): (u64, u64) = if unbiased < 0 {
        let (f, lo) = shift_right_jam_extra(sig, 0, (-(unbiased + 1)) as u32);
        (0, f | (lo != 0) as u64)
    } else {
        let frac_bits = 63 - unbiased as u32;
        if frac_bits == 0 {
            (sig, 0)
        } else {
            (sig >> frac_bits, sig << (64 - frac_bits))
        }
    };
    let mut v = int_part;
    if frac != 0 {
        st.raise(FLAG_INEXACT);
        let round_up = match st.rounding {
            Rounding::Nearest => {
                frac > 0x8000_0000_0000_0000 || (frac == 0x8000_0000_0000_0000 && v & 1 != 0)
            }
            Rounding::Zero => false,
            Rounding::Up => !sign,
            Rounding::Down => sign,
        };
        if round_up {
            st.rounded_up = true;
            v += 1;
        }
    }
    let limit = 1u64 << bits;
    if sign {
        if v > limit {
            return None;
        }
        Some((v as i64).wrapping_neg())
    } else {
        if v >= limit && bits == 63 {
            return None;
        }
        if v >= limit && v > i64::MAX as u64 {
            return None;
        }
        Some(v as i64)
    }
}

// --- f32 / f64 ---

pub fn from_f32(st: &mut Status, bits: u32) -> Float80 {
    let sign = bits >> 31 != 0;
    let exp = (bits >> 23 & 0xFF) as i32;
    let frac = (bits & 0x7F_FFFF) as u64;
    if exp == 0xFF {
        if frac == 0 {
            return Float80::infinity(sign);
        }
        if frac & 0x40_0000 == 0 {
            st.raise(FLAG_INVALID);
        }
        return Float80::from_parts(
            sign,
            0x7FFF,
            0xC000_0000_0000_0000 | (frac << 40),
        );
    }
    if exp == 0 {
        if frac == 0 {
            return Float80::from_parts(sign, 0, 0);
        }
        st.raise(crate::FLAG_DENORMAL);
        let s = frac.leading_zeros();
        return Float80::from_parts(sign, (16297 - s as i32) as u16, frac << s);
    }
    let sig = (frac | 0x80_0000) << 40;
    Float80::from_parts(sign, (exp - 127 + 0x3FFF) as u16, sig)
}

pub fn from_f64(st: &mut Status, bits: u64) -> Float80 {
    let sign = bits >> 63 != 0;
    let exp = (bits >> 52 & 0x7FF) as i32;
    let frac = bits & 0xF_FFFF_FFFF_FFFF;
    if exp == 0x7FF {
        if frac == 0 {
            return Float80::infinity(sign);
        }
        if frac & 0x8_0000_0000_0000 == 0 {
            st.raise(FLAG_INVALID);
        }
        return Float80::from_parts(
            sign,
            0x7FFF,
            0xC000_0000_0000_0000 | (frac << 11),
        );
    }
    if exp == 0 {
        if frac == 0 {
            return Float80::from_parts(sign, 0, 0);
        }
        st.raise(crate::FLAG_DENORMAL);
        let s = frac.leading_zeros();
        return Float80::from_parts(sign, (15372 - s as i32) as u16, frac << s);
    }
    let sig = (frac | 0x10_0000_0000_0000) << 11;
    Float80::from_parts(sign, (exp - 1023 + 0x3FFF) as u16, sig)
}

pub fn to_f32(st: &mut Status, a: Float80) -> u32 {
    if a.is_nan() || a.is_unsupported() {
        if a.is_signaling_nan() || a.is_unsupported() {
            st.raise(FLAG_INVALID);
        }
        if a.is_unsupported() {
            return 0xFFC0_0000;
        }
        let payload = (a.sig >> 40) as u32 & 0x3F_FFFF;
        return ((a.sign() as u32) << 31) | 0x7FC0_0000 | payload;
    }
    if a.is_inf() {
        return ((a.sign() as u32) << 31) | 0x7F80_0000;
    }
    if a.is_zero() {
        return (a.sign() as u32) << 31;
    }
    let (sign, exp, sig) = unpack(st, a);
    let unbiased = exp - 0x3FFF;
    if unbiased < -126 {
        // Denormal (or zero) in f32: one rounding at the 2^-149 grid.
        let (f, lo) = shift_right_jam_extra(sig, 0, ((-unbiased - 86) as u32).min(127));
        let frac = round_frac(st, sign, f, lo);
        return ((sign as u32) << 31) | frac as u32;
    }
    // Normal range: round the significand to 24 bits, then repack.
    let mut sub = Status {
        rounding: st.rounding,
        precision: Precision::Single,
        flags: 0,
        rounded_up: false,
    };
    let r = round_pack(&mut sub, sign, exp, sig, 0);
    st.flags |= sub.flags;
    st.rounded_up |= sub.rounded_up;
    let unbiased = r.exp() as i32 - 0x3FFF;
    if r.is_inf() || unbiased > 127 {
        st.raise(crate::FLAG_OVERFLOW | FLAG_INEXACT);
        return match st.rounding {
            Rounding::Zero => ((sign as u32) << 31) | 0x7F7F_FFFF,
            Rounding::Down if !sign => 0x7F7F_FFFF,
            Rounding::Up if sign => 0xFF7F_FFFF,
            _ => ((sign as u32) << 31) | 0x7F80_0000,
        };
    }
    let frac = (r.sig >> 40) as u32 & 0x7F_FFFF;
    ((sign as u32) << 31) | (((unbiased + 127) as u32) << 23) | frac
}

pub fn to_f64(st: &mut Status, a: Float80) -> u64 {
    if a.is_nan() || a.is_unsupported() {
        if a.is_signaling_nan() || a.is_unsupported() {
            st.raise(FLAG_INVALID);
        }
        if a.is_unsupported() {
            return 0xFFF8_0000_0000_0000;
        }
        let payload = (a.sig >> 11) & 0x7_FFFF_FFFF_FFFF;
        return ((a.sign() as u64) << 63) | 0x7FF8_0000_0000_0000 | payload;
    }
    if a.is_inf() {
        return ((a.sign() as u64) << 63) | 0x7FF0_0000_0000_0000;
    }
    if a.is_zero() {
        return (a.sign() as u64) << 63;
    }
    let (sign, exp, sig) = unpack(st, a);
    let unbiased = exp - 0x3FFF;
    if unbiased < -1022 {
        let (f, lo) = shift_right_jam_extra(sig, 0, ((-unbiased - 1011) as u32).min(127));
        let frac = round_frac(st, sign, f, lo);
        return ((sign as u64) << 63) | frac;
    }
    let mut sub = Status {
        rounding: st.rounding,
        precision: Precision::Double,
        flags: 0,
        rounded_up: false,
    };
    let r = round_pack(&mut sub, sign, exp, sig, 0);
    st.flags |= sub.flags;
    st.rounded_up |= sub.rounded_up;
    let unbiased = r.exp() as i32 - 0x3FFF;
    if r.is_inf() || unbiased > 1023 {
        st.raise(crate::FLAG_OVERFLOW | FLAG_INEXACT);
        return match st.rounding {
            Rounding::Zero => ((sign as u64) << 63) | 0x7FEF_FFFF_FFFF_FFFF,
            Rounding::Down if !sign => 0x7FEF_FFFF_FFFF_FFFF,
            Rounding::Up if sign => 0xFFEF_FFFF_FFFF_FFFF,
            _ => ((sign as u64) << 63) | 0x7FF0_0000_0000_0000,
        };
    }
    let frac = (r.sig >> 11) & 0xF_FFFF_FFFF_FFFF;
    ((sign as u64) << 63) | (((unbiased + 1023) as u64) << 52) | frac
}

/// Round a right-shifted denormal fraction with its jammed extra word; a
/// carry out of the fraction lands in the exponent field, which is exactly
/// the smallest-normal encoding.
fn round_frac(st: &mut Status, sign: bool, sig: u64, extra: u64) -> u64 {
    let mut v = sig;
    if extra != 0 {
        st.raise(FLAG_INEXACT | crate::FLAG_UNDERFLOW);
        let round_up = match st.rounding {
            Rounding::Nearest => {
                extra > 0x8000_0000_0000_0000 || (extra == 0x8000_0000_0000_0000 && v & 1 != 0)
            }
            Rounding::Zero => false,
            Rounding::Up => !sign,
            Rounding::Down => sign,
        };
        if round_up {
            st.rounded_up = true;
            v += 1;
        }
    }
    v
}

/// Lossy view for the transcendental helpers (not used for stores).
pub(crate) fn to_f64_lossy(a: Float80) -> f64 {
    let mut st = Status::new();
    f64::from_bits(to_f64(&mut st, a))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_round_trip() {
        let mut st = Status::new();
        for v in [0i64, 1, -1, 5, -5, 123_456_789, i64::MIN + 1, i32::MAX as i64] {
            assert_eq!(to_i64(&mut st, from_i64(v)), v, "value {v}");
        }
    }

    #[test]
    fn f64_round_trip_is_exact() {
        let mut st = Status::new();
        for v in [0.0f64, 1.0, -2.5, 1e300, 1e-300, core::f64::consts::PI] {
            let f = from_f64(&mut st, v.to_bits());
            assert_eq!(to_f64(&mut st, f), v.to_bits(), "value {v}");
        }
    }

    #[test]
    fn f32_nan_quiets_and_flags() {
        let mut st = Status::new();
        let snan = from_f32(&mut st, 0x7F80_0001);
        assert_ne!(st.flags & FLAG_INVALID, 0);
        assert!(snan.is_nan() && !snan.is_signaling_nan());
    }

    #[test]
    fn fist_rounds_by_mode() {
        let mut st = Status::new();
        let half = from_f64(&mut st, 0.5f64.to_bits());
        st.rounding = Rounding::Nearest;
        assert_eq!(to_i32(&mut st, half), 0);
        st.rounding = Rounding::Up;
        assert_eq!(to_i32(&mut st, half), 1);
        let neg = from_f64(&mut st, (-2.5f64).to_bits());
        st.rounding = Rounding::Nearest;
        assert_eq!(to_i32(&mut st, neg), -2);
        st.rounding = Rounding::Down;
        assert_eq!(to_i32(&mut st, neg), -3);
    }

    #[test]
    fn out_of_range_fist_is_indefinite() {
        let mut st = Status::new();
        let big = from_i64(1 << 40);
        assert_eq!(to_i16(&mut st, big), i16::MIN);
        assert_ne!(st.flags & FLAG_INVALID, 0);
    }
}
