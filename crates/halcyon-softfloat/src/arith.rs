//! Add/sub/mul/div/sqrt/remainder and comparison on the 80-bit format.

use crate::{
    normalize_sub, propagate_nan, round_pack, shift_right_jam_extra, unpack, Float80, Rounding,
    Status, FLAG_DIV_ZERO, FLAG_INEXACT, FLAG_INVALID,
};

/// Result of a floating-point comparison.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FloatRelation {
    Less,
    Equal,
    Greater,
    Unordered,
}

#[inline]
fn invalid(st: &mut Status) -> Float80 {
    st.raise(FLAG_INVALID);
    Float80::INDEFINITE
}

fn add_sigs(st: &mut Status, a: Float80, b: Float80, sign: bool) -> Float80 {
    let (_, mut aexp, mut asig) = unpack(st, a);
    let (_, mut bexp, mut bsig) = unpack(st, b);

    if a.is_inf() {
        return a;
    }
    if b.is_inf() {
        return Float80::from_parts(sign, 0x7FFF, b.sig);
    }
    if asig == 0 {
        if bsig == 0 {
            return Float80::from_parts(sign, 0, 0);
        }
        core::mem::swap(&mut aexp, &mut bexp);
        core::mem::swap(&mut asig, &mut bsig);
    }
    if bsig == 0 {
        return round_pack(st, sign, aexp, asig, 0);
    }

    let expdiff = aexp - bexp;
    let (zexp, zsig, extra) = if expdiff > 0 {
        let (s, e) = shift_right_jam_extra(bsig, 0, expdiff as u32);
        let (sum, carry) = asig.overflowing_add(s);
        if carry {
            let (s2, e2) = shift_right_jam_extra(sum, e, 1);
            (aexp + 1, s2 | 0x8000_0000_0000_0000, e2)
        } else {
            (aexp, sum, e)
        }
    } else if expdiff < 0 {
        let (s, e) = shift_right_jam_extra(asig, 0, (-expdiff) as u32);
        let (sum, carry) = bsig.overflowing_add(s);
        if carry {
            let (s2, e2) = shift_right_jam_extra(sum, e, 1);
            (bexp + 1, s2 | 0x8000_0000_0000_0000, e2)
        } else {
            (bexp, sum, e)
        }
    } else {
        // Both integer bits set: the sum always carries out.
        let sum = asig.wrapping_add(bsig);
        (aexp + 1, 0x8000_0000_0000_0000 | (sum >> 1), (sum & 1) << 63)
    };
    round_pack(st, sign, zexp, zsig, extra)
}

fn sub_sigs(st: &mut Status, a: Float80, b: Float80, sign: bool) -> Float80 {
    let (_, aexp, asig) = unpack(st, a);
    let (_, bexp, bsig) = unpack(st, b);

    if a.is_inf() {
        if b.is_inf() {
            return invalid(st);
        }
        return a;
    }
    if b.is_inf() {
        return Float80::from_parts(!sign, 0x7FFF, b.sig);
    }
    if bsig == 0 {
        if asig == 0 {
            // (+x) - (+x) style exact zero: sign is + except round-down.
            let zsign = st.rounding == Rounding::Down;
            return Float80::from_parts(zsign, 0, 0);
        }
        return round_pack(st, sign, aexp, asig, 0);
    }
    if asig == 0 {
        return round_pack(st, !sign, bexp, bsig, 0);
    }

    let expdiff = aexp - bexp;
    let (zsign, zexp, diff, extra) = if expdiff > 0 {
        let (s, e) = shift_right_jam_extra(bsig, 0, expdiff as u32);
        sub_wide(sign, aexp, asig, s, e)
    } else if expdiff < 0 {
        let (s, e) = shift_right_jam_extra(asig, 0, (-expdiff) as u32);
        sub_wide(!sign, bexp, bsig, s, e)
    } else if asig > bsig {
        (sign, aexp, asig - bsig, 0)
    } else if bsig > asig {
        (!sign, aexp, bsig - asig, 0)
    } else {
        let zsign = st.rounding == Rounding::Down;
        return Float80::from_parts(zsign, 0, 0);
    };
    if diff == 0 && extra == 0 {
        let zsign = st.rounding == Rounding::Down;
        return Float80::from_parts(zsign, 0, 0);
    }
    // Normalize left.
    let (mut exp, mut sig, mut ext) = (zexp, diff, extra);
    if sig == 0 {
        sig = ext;
        ext = 0;
        exp -= 64;
    }
    let shift = sig.leading_zeros();
    if shift != 0 {
        sig = (sig << shift) | (ext >> (64 - shift));
        ext <<= shift;
        exp -= shift as i32;
    }
    round_pack(st, zsign, exp, sig, ext)
}

/// `big.extra_b - small.extra_s` where `big` has the larger exponent.
#[inline]
fn sub_wide(sign: bool, exp: i32, big: u64, small: u64, small_extra: u64) -> (bool, i32, u64, u64) {
    let a = (big as u128) << 64;
    let b = ((small as u128) << 64) | small_extra as u128;
    let d = a.wrapping_sub(b);
    (sign, exp, (d >> 64) as u64, d as u64)
}

pub fn add(st: &mut Status, a: Float80, b: Float80) -> Float80 {
    if a.is_nan() || b.is_nan() || a.is_unsupported() || b.is_unsupported() {
        return propagate_nan(st, a, b);
    }
    if a.sign() == b.sign() {
        add_sigs(st, a, b, a.sign())
    } else {
        sub_sigs(st, a, b, a.sign())
    }
}

pub fn sub(st: &mut Status, a: Float80, b: Float80) -> Float80 {
    if a.is_nan() || b.is_nan() || a.is_unsupported() || b.is_unsupported() {
        return propagate_nan(st, a, b);
    }
    if a.sign() == b.sign() {
        sub_sigs(st, a, b, a.sign())
    } else {
        add_sigs(st, a, b, a.sign())
    }
}

pub fn mul(st: &mut Status, a: Float80, b: Float80) -> Float80 {
    if a.is_nan() || b.is_nan() || a.is_unsupported() || b.is_unsupported() {
        return propagate_nan(st, a, b);
    }
    let sign = a.sign() ^ b.sign();
    if a.is_inf() || b.is_inf() {
        if a.is_zero() || b.is_zero() {
            return invalid(st);
        }
        return Float80::infinity(sign);
    }
    let (_, aexp, asig) = unpack(st, a);
    let (_, bexp, bsig) = unpack(st, b);
    if asig == 0 || bsig == 0 {
        return Float80::from_parts(sign, 0, 0);
    }
    let mut zexp = aexp + bexp - 0x3FFE;
    let product = (asig as u128) * (bsig as u128);
    let mut sig = (product >> 64) as u64;
    let mut extra = product as u64;
    if sig & 0x8000_0000_0000_0000 == 0 {
        sig = (sig << 1) | (extra >> 63);
        extra <<= 1;
        zexp -= 1;
    }
    round_pack(st, sign, zexp, sig, extra)
}

pub fn div(st: &mut Status, a: Float80, b: Float80) -> Float80 {
    if a.is_nan() || b.is_nan() || a.is_unsupported() || b.is_unsupported() {
        return propagate_nan(st, a, b);
    }
    let sign = a.sign() ^ b.sign();
    if a.is_inf() {
        if b.is_inf() {
            return invalid(st);
        }
        return Float80::infinity(sign);
    }
    if b.is_inf() {
        return Float80::from_parts(sign, 0, 0);
    }
    if b.is_zero() {
        if a.is_zero() {
            return invalid(st);
        }
        st.raise(FLAG_DIV_ZERO);
        return Float80::infinity(sign);
    }
    let (_, aexp, asig) = unpack(st, a);
    let (_, bexp, bsig) = unpack(st, b);
    if asig == 0 {
        return Float80::from_parts(sign, 0, 0);
    }

    let mut zexp = aexp - bexp + 0x3FFE;
    let wide = if asig >= bsig {
        zexp += 1;
        (asig as u128) << 63
    } else {
        (asig as u128) << 64
    };
    let q = (wide / bsig as u128) as u64;
    let rem = wide % bsig as u128;
    let extra = (((rem << 64) / bsig as u128) as u64) | ((rem << 64) % bsig as u128 != 0) as u64;
    round_pack(st, sign, zexp, q, extra)
}

/// Integer square root of a 128-bit value (floor).
fn isqrt128(n: u128) -> u128 {
    if n == 0 {
        return 0;
    }
    let mut x: u128 = 1u128 << ((127 - n.leading_zeros() as i32) / 2 + 1);
    // Newton iterations converge in a handful of steps from this estimate.
    loop {
        let y = (x + n / x) >> 1;
        if y >= x {
            return x;
        }
        x = y;
    }
}

pub fn sqrt(st: &mut Status, a: Float80) -> Float80 {
    if a.is_nan() || a.is_unsupported() {
        return propagate_nan(st, a, a);
    }
    if a.is_zero() {
        return a;
    }
    if a.sign() {
        return invalid(st);
    }
    if a.is_inf() {
        return a;
    }
    let (_, aexp, asig) = unpack(st, a);
    let e = aexp - 0x3FFF;
    let (n, zexp) = if e & 1 == 0 {
        ((asig as u128) << 63, (e >> 1) + 0x3FFF)
    } else {
        ((asig as u128) << 64, ((e - 1) >> 1) + 0x3FFF)
    };
    let r = isqrt128(n);
    let rem = n - r * r;
    // f ~= rem / 2r; f >= 1/2 iff rem > r (never an exact tie).
    let extra: u64 = if rem > r {
        0x8000_0000_0000_0001
    } else if rem != 0 {
        1
    } else {
        0
    };
    round_pack(st, false, zexp, r as u64, extra)
}

/// Output of [`rem`]: the remainder plus the low quotient bits for C0/C3/C1,
/// and whether the reduction is partial (C2).
pub struct RemResult {
    pub value: Float80,
    pub quotient: u64,
    pub partial: bool,
}

/// x87 partial remainder. `round_nearest` selects FPREM1 (IEEE remainder)
/// over FPREM (truncating).
pub fn rem(st: &mut Status, a: Float80, b: Float80, round_nearest: bool) -> RemResult {
    let fail = |st: &mut Status| RemResult {
        value: invalid(st),
        quotient: 0,
        partial: false,
    };
    if a.is_nan() || b.is_nan() || a.is_unsupported() || b.is_unsupported() {
        return RemResult {
            value: propagate_nan(st, a, b),
            quotient: 0,
            partial: false,
        };
    }
    if a.is_inf() || b.is_zero() {
        return fail(st);
    }
    if b.is_inf() || a.is_zero() {
        return RemResult {
            value: a,
            quotient: 0,
            partial: false,
        };
    }
    let (asign, aexp, asig) = unpack(st, a);
    let (_, bexp, bsig) = unpack(st, b);
    let expdiff = aexp - bexp;

    if expdiff < 0 {
        // |a| < |b|: the truncating form always yields a itself. The
        // nearest form may still subtract one |b| when |a| > |b|/2.
        if expdiff < -1 || !round_nearest || asig <= bsig {
            return RemResult {
                value: a,
                quotient: 0,
                partial: false,
            };
        }
        // expdiff == -1 and 2|a| > |b|: q = 1, remainder flips sign.
        // In units of a's exponent, |b| = 2*bsig, so |r| = 2*bsig - asig,
        // which is < bsig because asig > bsig.
        let m = bsig - (asig - bsig);
        let (e, s) = norm_rem(m, aexp);
        return RemResult {
            value: pack_rem(!asign, e, s),
            quotient: 1,
            partial: false,
        };
    }

    if expdiff > 63 {
        // Partial reduction: peel off 63 quotient bits per pass.
        let chunk = 63;
        let num = (asig as u128) << chunk;
        let q = num / bsig as u128;
        let r = (num % bsig as u128) as u64;
        let value = if r == 0 {
            Float80::from_parts(asign, 0, 0)
        } else {
            let (e, s) = norm_rem(r, aexp - chunk as i32);
            pack_rem(asign, e, s)
        };
        return RemResult {
            value,
            quotient: q as u64 & 7,
            partial: true,
        };
    }

    let num = (asig as u128) << expdiff;
    let mut q = (num / bsig as u128) as u64;
    let r = (num % bsig as u128) as u64;
    if round_nearest {
        // Round the quotient to nearest even; on round-up the remainder
        // flips sign.
        let twice = (r as u128) << 1;
        if twice > bsig as u128 || (twice == bsig as u128 && q & 1 != 0) {
            q = q.wrapping_add(1);
            let nr = bsig - r;
            let (e, s) = norm_rem(nr, bexp);
            return RemResult {
                value: pack_rem(!asign, e, s),
                quotient: q & 7,
                partial: false,
            };
        }
    }
    let value = if r == 0 {
        Float80::from_parts(asign, 0, 0)
    } else {
        let (e, s) = norm_rem(r, bexp);
        pack_rem(asign, e, s)
    };
    RemResult {
        value,
        quotient: q & 7,
        partial: false,
    }
}

/// Normalize a remainder significand against the exponent its units carry.
#[inline]
fn norm_rem(r: u64, exp: i32) -> (i32, u64) {
    let shift = r.leading_zeros() as i32;
    (exp - shift, r << shift)
}

/// Pack an exact remainder, denormalizing when the exponent bottoms out.
#[inline]
fn pack_rem(sign: bool, e: i32, mut sig: u64) -> Float80 {
    if e <= 0 {
        let shift = (1 - e) as u32;
        sig = if shift >= 64 { 0 } else { sig >> shift };
        return Float80::from_parts(sign, 0, sig);
    }
    Float80::from_parts(sign, e as u16, sig)
}

/// Round to an integral value per the status rounding mode (FRNDINT).
pub fn round_to_int(st: &mut Status, a: Float80) -> Float80 {
    if a.is_nan() || a.is_unsupported() {
        return propagate_nan(st, a, a);
    }
    if a.is_inf() || a.is_zero() {
        return a;
    }
    let (sign, exp, sig) = unpack(st, a);
    if exp >= 0x3FFF + 63 {
        return a; // Already integral.
    }
    if exp < 0x3FFE {
        // |a| < 1/2 (or exactly representable fractions): rounds to 0 or 1.
        st.raise(FLAG_INEXACT);
        let one = match st.rounding {
            Rounding::Nearest => exp == 0x3FFE && sig > 0x8000_0000_0000_0000,
            Rounding::Zero => false,
            Rounding::Up => !sign,
            Rounding::Down => sign,
        };
        return if one {
            Float80::from_parts(sign, 0x3FFF, 0x8000_0000_0000_0000)
        } else {
            Float80::from_parts(sign, 0, 0)
        };
    }
    let frac_bits = (0x3FFF + 63 - exp) as u32;
    let mask = (1u64 << frac_bits) - 1;
    let frac = sig & mask;
    if frac == 0 {
        return Float80::from_parts(sign, exp as u16, sig);
    }
    st.raise(FLAG_INEXACT);
    let half = 1u64 << (frac_bits - 1);
    let round_up = match st.rounding {
        Rounding::Nearest => frac > half || (frac == half && sig & (mask + 1) != 0),
        Rounding::Zero => false,
        Rounding::Up => !sign,
        Rounding::Down => sign,
    };
    let mut sig = sig & !mask;
    let mut exp = exp;
    if round_up {
        st.rounded_up = true;
        let (s, carry) = sig.overflowing_add(mask + 1);
        sig = s;
        if carry {
            sig = 0x8000_0000_0000_0000;
            exp += 1;
        }
    }
    Float80::from_parts(sign, exp as u16, sig)
}

/// FSCALE: `a * 2^trunc(b)`.
pub fn scale(st: &mut Status, a: Float80, b: Float80) -> Float80 {
    if a.is_nan() || b.is_nan() || a.is_unsupported() || b.is_unsupported() {
        return propagate_nan(st, a, b);
    }
    if b.is_inf() {
        if b.sign() {
            if a.is_inf() {
                return invalid(st);
            }
            return Float80::from_parts(a.sign(), 0, 0);
        }
        if a.is_zero() {
            return invalid(st);
        }
        return Float80::infinity(a.sign());
    }
    if a.is_inf() || a.is_zero() {
        return a;
    }
    let (sign, exp, sig) = unpack(st, a);
    // trunc(b) saturated well past the representable exponent range.
    let n = {
        let bexp = b.exp() as i32;
        if b.is_zero() {
            0
        } else if bexp >= 0x3FFF + 30 {
            if b.sign() {
                -(1 << 30)
            } else {
                1 << 30
            }
        } else if bexp < 0x3FFF {
            0
        } else {
            let shift = 63 - (bexp - 0x3FFF);
            let v = (b.sig >> shift) as i64;
            if b.sign() {
                -(v as i32)
            } else {
                v as i32
            }
        }
    };
    round_pack(st, sign, exp + n, sig, 0)
}

/// FXTRACT: split into exponent and significand parts.
pub fn extract(st: &mut Status, a: Float80) -> (Float80, Float80) {
    if a.is_nan() || a.is_unsupported() {
        let n = propagate_nan(st, a, a);
        return (n, n);
    }
    if a.is_inf() {
        return (Float80::infinity(false), a);
    }
    if a.is_zero() {
        st.raise(FLAG_DIV_ZERO);
        return (Float80::infinity(true), a);
    }
    let (sign, exp, sig) = unpack(st, a);
    let e = exp - 0x3FFF;
    (
        crate::convert::from_i64(e as i64),
        Float80::from_parts(sign, 0x3FFF, sig),
    )
}

/// Ordered compare (FCOM family): any NaN operand is invalid.
pub fn compare(st: &mut Status, a: Float80, b: Float80) -> FloatRelation {
    if a.is_nan() || b.is_nan() || a.is_unsupported() || b.is_unsupported() {
        st.raise(FLAG_INVALID);
        return FloatRelation::Unordered;
    }
    compare_ordered(st, a, b)
}

/// Unordered compare (FUCOM family): only signaling NaNs are invalid.
pub fn compare_quiet(st: &mut Status, a: Float80, b: Float80) -> FloatRelation {
    if a.is_nan() || b.is_nan() || a.is_unsupported() || b.is_unsupported() {
        if a.is_signaling_nan() || b.is_signaling_nan() || a.is_unsupported() || b.is_unsupported()
        {
            st.raise(FLAG_INVALID);
        }
        return FloatRelation::Unordered;
    }
    compare_ordered(st, a, b)
}

fn compare_ordered(st: &mut Status, a: Float80, b: Float80) -> FloatRelation {
    let (asign, aexp, asig) = unpack(st, a);
    let (bsign, bexp, bsig) = unpack(st, b);
    let azero = asig == 0;
    let bzero = bsig == 0;
    if azero && bzero {
        return FloatRelation::Equal;
    }
    if azero {
        return if bsign {
            FloatRelation::Greater
        } else {
            FloatRelation::Less
        };
    }
    if bzero {
        return if asign {
            FloatRelation::Less
        } else {
            FloatRelation::Greater
        };
    }
    if asign != bsign {
        return if asign {
            FloatRelation::Less
        } else {
            FloatRelation::Greater
        };
    }
    let mag = match (aexp, asig).cmp(&(bexp, bsig)) {
        core::cmp::Ordering::Less => FloatRelation::Less,
        core::cmp::Ordering::Equal => return FloatRelation::Equal,
        core::cmp::Ordering::Greater => FloatRelation::Greater,
    };
    if asign {
        match mag {
            FloatRelation::Less => FloatRelation::Greater,
            FloatRelation::Greater => FloatRelation::Less,
            other => other,
        }
    } else {
        mag
    }
}

/// Normalize any packed value (used after loading possibly-denormal images).
pub fn normalize(a: Float80) -> Float80 {
    if a.exp() == 0 && a.sig != 0 {
        let (e, s) = normalize_sub(a.sig);
        if e > 0 {
            return Float80::from_parts(a.sign(), e as u16, s);
        }
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::from_i64;

    fn st() -> Status {
        Status::new()
    }

    #[test]
    fn small_integer_arithmetic_is_exact() {
        let mut s = st();
        let two = from_i64(2);
        let three = from_i64(3);
        assert_eq!(add(&mut s, two, three), from_i64(5));
        assert_eq!(sub(&mut s, two, three), from_i64(-1));
        assert_eq!(mul(&mut s, two, three), from_i64(6));
        assert_eq!(s.flags, 0);
    }

    #[test]
    fn division_rounds_and_flags_inexact() {
        let mut s = st();
        let q = div(&mut s, from_i64(1), from_i64(3));
        assert_eq!(s.flags & FLAG_INEXACT, FLAG_INEXACT);
        // 1/3 in extended precision: 0x3FFD:AAAAAAAAAAAAAAAB (nearest).
        assert_eq!(q.exp(), 0x3FFD);
        assert_eq!(q.sig, 0xAAAA_AAAA_AAAA_AAAB);
    }

    #[test]
    fn divide_by_zero_returns_signed_infinity() {
        let mut s = st();
        let r = div(&mut s, from_i64(-1), Float80::ZERO);
        assert!(r.is_inf() && r.sign());
        assert_eq!(s.flags & FLAG_DIV_ZERO, FLAG_DIV_ZERO);
    }

    #[test]
    fn sqrt_of_nine_is_three() {
        let mut s = st();
        assert_eq!(sqrt(&mut s, from_i64(9)), from_i64(3));
        assert_eq!(s.flags, 0);
        assert!(sqrt(&mut s, from_i64(-1)).is_nan());
        assert_ne!(s.flags & FLAG_INVALID, 0);
    }

    #[test]
    fn sqrt_two_matches_reference_bits() {
        let mut s = st();
        let r = sqrt(&mut s, from_i64(2));
        // sqrt(2) = 0x3FFF:B504F333F9DE6484 (round to nearest).
        assert_eq!(r.exp(), 0x3FFF);
        assert_eq!(r.sig, 0xB504_F333_F9DE_6484);
    }

    #[test]
    fn fprem_truncates_and_reports_quotient_bits() {
        let mut s = st();
        let r = rem(&mut s, from_i64(17), from_i64(5), false);
        assert!(!r.partial);
        assert_eq!(r.quotient & 7, 3);
        assert_eq!(r.value, from_i64(2));
    }

    #[test]
    fn fprem1_rounds_to_nearest() {
        let mut s = st();
        // 7 rem 4: trunc gives 3 (q=1), nearest gives -1 (q=2).
        let r = rem(&mut s, from_i64(7), from_i64(4), true);
        assert_eq!(r.value, from_i64(-1));
        assert_eq!(r.quotient & 7, 2);
    }

    #[test]
    fn compare_orders_signed_zeros_equal() {
        let mut s = st();
        let nz = Float80::ZERO.neg();
        assert_eq!(compare(&mut s, Float80::ZERO, nz), FloatRelation::Equal);
        assert_eq!(
            compare(&mut s, from_i64(-2), from_i64(1)),
            FloatRelation::Less
        );
        assert_eq!(
            compare(&mut s, Float80::INDEFINITE, from_i64(1)),
            FloatRelation::Unordered
        );
    }

    #[test]
    fn round_to_int_all_modes() {
        let mut s = st();
        let half = div(&mut s, from_i64(1), from_i64(2));
        s.clear();
        s.rounding = Rounding::Nearest;
        assert_eq!(round_to_int(&mut s, half), Float80::ZERO); // ties-to-even
        s.rounding = Rounding::Up;
        assert_eq!(round_to_int(&mut s, half), from_i64(1));
        s.rounding = Rounding::Down;
        assert_eq!(round_to_int(&mut s, half), Float80::ZERO);
        s.rounding = Rounding::Zero;
        assert_eq!(round_to_int(&mut s, half.neg()), Float80::ZERO.neg());
    }
}
