//! Algebraic properties of the BigNum engine

use std::cmp::Ordering;

use quickcheck::quickcheck;

use lux_engine::{BigFloat, BigInt};

fn bigint_from_parts(sign: bool, limbs: Vec<u32>) -> BigInt {
    let mut n = BigInt {
        sign: if sign { 1 } else { -1 },
        limbs,
    };
    while n.limbs.last() == Some(&0) {
        n.limbs.pop();
    }
    if n.limbs.is_empty() {
        n.sign = 1;
    }
    n
}

quickcheck! {
    fn prop_add_sub_round_trip(a_sign: bool, a_limbs: Vec<u32>, b_sign: bool, b_limbs: Vec<u32>) -> bool {
        let a = bigint_from_parts(a_sign, a_limbs);
        let b = bigint_from_parts(b_sign, b_limbs);
        // add(sub(a, b), b) == a
        a.sub(&b).add(&b) == a
    }

    fn prop_mul_zero_annihilates(sign: bool, limbs: Vec<u32>) -> bool {
        let a = bigint_from_parts(sign, limbs);
        a.mul(&BigInt::zero()).is_zero()
    }

    fn prop_compare_antisymmetric(a_sign: bool, a_limbs: Vec<u32>, b_sign: bool, b_limbs: Vec<u32>) -> bool {
        let a = bigint_from_parts(a_sign, a_limbs);
        let b = bigint_from_parts(b_sign, b_limbs);
        a.compare(&b) == b.compare(&a).reverse()
    }

    fn prop_decimal_round_trip(value: i64) -> bool {
        let n = BigInt::from_i64(value);
        BigInt::from_decimal(&n.to_decimal()).unwrap() == n
    }

    fn prop_div_mod_reconstructs(a: i64, b: i64) -> bool {
        if b == 0 {
            return true;
        }
        let big_a = BigInt::from_i64(a);
        let big_b = BigInt::from_i64(b);
        let (q, r) = big_a.div_mod(&big_b).unwrap();
        // a == q*b + r
        q.mul(&big_b).add(&r) == big_a
    }

    fn prop_bigfloat_string_round_trip(mantissa: i64, exp: i16) -> bool {
        let mut f = BigFloat::from_i64(mantissa);
        f.exp = exp as i64;
        if f.is_zero() {
            f.exp = 0;
        }
        BigFloat::from_string(&f.to_decimal()).unwrap() == f
    }
}

#[test]
fn test_two_to_the_hundred() {
    // from_string("1267650600228229401496703205376") is 2^100
    let literal = "1267650600228229401496703205376";
    let n = BigInt::from_decimal(literal).unwrap();
    assert_eq!(n.to_decimal(), literal);

    let two_99 = BigInt::from_i64(2).pow(99).unwrap();
    assert_eq!(n.compare(&two_99.add(&two_99)), Ordering::Equal);
}

#[test]
fn test_bigfloat_absorption_and_exact_recovery() {
    let huge = BigFloat::from_string("1e100").unwrap();
    let one = BigFloat::from_string("1").unwrap();

    let sum = huge.add(&one);
    // at default display precision the unit is absorbed
    assert_eq!(sum.to_display(), huge.to_display());
    // but subtraction recovers it exactly
    assert_eq!(sum.sub(&huge).compare(&one), Ordering::Equal);
}

#[test]
fn test_transitive_compare() {
    let a = BigFloat::from_string("1.5e10").unwrap();
    let b = BigFloat::from_string("2.5e10").unwrap();
    let c = BigFloat::from_string("1e11").unwrap();
    assert_eq!(a.compare(&b), Ordering::Less);
    assert_eq!(b.compare(&c), Ordering::Less);
    assert_eq!(a.compare(&c), Ordering::Less);
}
