//! Property tests: conversions round-trip exactly and arithmetic agrees
//! with the host FPU wherever the host result is exactly representable.

use halcyon_softfloat::arith;
use halcyon_softfloat::convert;
use halcyon_softfloat::Status;
use proptest::prelude::*;

proptest! {
    #[test]
    fn i64_survives_the_trip(v in any::<i64>()) {
        let mut st = Status::new();
        let f = convert::from_i64(v);
        prop_assert_eq!(convert::to_i64(&mut st, f), v);
    }

    #[test]
    fn f64_bits_survive_the_trip(bits in any::<u64>()) {
        let mut st = Status::new();
        let f = convert::from_f64(&mut st, bits);
        let back = convert::to_f64(&mut st, f);
        let x = f64::from_bits(bits);
        if x.is_nan() {
            // NaNs come back quiet with the payload preserved.
            prop_assert!(f64::from_bits(back).is_nan());
        } else {
            prop_assert_eq!(back, bits);
        }
    }

    #[test]
    fn add_matches_host_on_small_integers(a in -1_000_000i64..1_000_000, b in -1_000_000i64..1_000_000) {
        let mut st = Status::new();
        let r = arith::add(&mut st, convert::from_i64(a), convert::from_i64(b));
        prop_assert_eq!(convert::to_i64(&mut st, r), a + b);
    }

    #[test]
    fn mul_matches_host_on_small_integers(a in -1_000_000i64..1_000_000, b in -1_000_000i64..1_000_000) {
        let mut st = Status::new();
        let r = arith::mul(&mut st, convert::from_i64(a), convert::from_i64(b));
        prop_assert_eq!(convert::to_i64(&mut st, r), a * b);
    }

    #[test]
    fn div_matches_host_f64(a in any::<i32>(), b in any::<i32>()) {
        prop_assume!(b != 0);
        let mut st = Status::new();
        let q = arith::div(&mut st, convert::from_i32(a), convert::from_i32(b));
        // The extended quotient rounded to double must equal the host's
        // double division (one rounding each, same 53-bit target is only
        // guaranteed when the extended result is exact at 64 bits, so
        // compare through the extended-to-double store of the host value).
        let host = a as f64 / b as f64;
        let stored = f64::from_bits(convert::to_f64(&mut st, q));
        prop_assert!((stored - host).abs() <= host.abs() * f64::EPSILON);
    }
}
