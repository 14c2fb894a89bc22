//! Arbitrary-precision integers
//!
//! Sign-and-magnitude representation over little-endian u32 limbs
//! (`limbs[0]` is least significant). A `BigInt` is normalised iff it has
//! no limbs (the canonical +0) or its top limb is non-zero; every public
//! operation returns a normalised result.

use std::cmp::Ordering;

use crate::error::NumError;

/// Limb base, 2^32
const BASE: u64 = 1 << 32;

/// An arbitrary-precision signed integer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigInt {
    /// -1 or +1; +1 for zero
    pub sign: i8,
    /// Magnitude, little-endian base-2^32
    pub limbs: Vec<u32>,
}

/// Drop leading zero limbs; zero forces a positive sign
fn normalize(sign: &mut i8, limbs: &mut Vec<u32>) {
    while limbs.last() == Some(&0) {
        limbs.pop();
    }
    if limbs.is_empty() {
        *sign = 1;
    }
}

/// Compare magnitudes: limb count first, then top-down limb-wise
pub(crate) fn cmp_abs(a: &[u32], b: &[u32]) -> Ordering {
    if a.len() != b.len() {
        return a.len().cmp(&b.len());
    }
    for i in (0..a.len()).rev() {
        if a[i] != b[i] {
            return a[i].cmp(&b[i]);
        }
    }
    Ordering::Equal
}

/// Schoolbook magnitude addition
pub(crate) fn add_abs(a: &[u32], b: &[u32]) -> Vec<u32> {
    let len = a.len().max(b.len());
    let mut out = Vec::with_capacity(len + 1);
    let mut carry: u64 = 0;
    for i in 0..len {
        let mut sum = carry;
        if i < a.len() {
            sum += a[i] as u64;
        }
        if i < b.len() {
            sum += b[i] as u64;
        }
        out.push(sum as u32);
        carry = sum >> 32;
    }
    if carry != 0 {
        out.push(carry as u32);
    }
    while out.last() == Some(&0) {
        out.pop();
    }
    out
}

/// Schoolbook magnitude subtraction; requires |a| >= |b|
pub(crate) fn sub_abs(a: &[u32], b: &[u32]) -> Vec<u32> {
    debug_assert!(cmp_abs(a, b) != Ordering::Less);
    let mut out = Vec::with_capacity(a.len());
    let mut borrow: i64 = 0;
    for i in 0..a.len() {
        let mut diff = a[i] as i64 - borrow;
        if i < b.len() {
            diff -= b[i] as i64;
        }
        if diff < 0 {
            diff += BASE as i64;
            borrow = 1;
        } else {
            borrow = 0;
        }
        out.push(diff as u32);
    }
    while out.last() == Some(&0) {
        out.pop();
    }
    out
}

/// Schoolbook O(n*m) limb product with a 64-bit accumulator
pub(crate) fn mul_abs(a: &[u32], b: &[u32]) -> Vec<u32> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    let mut out = vec![0u32; a.len() + b.len()];
    for (i, &ai) in a.iter().enumerate() {
        let mut carry: u64 = 0;
        for (j, &bj) in b.iter().enumerate() {
            let t = ai as u64 * bj as u64 + out[i + j] as u64 + carry;
            out[i + j] = t as u32;
            carry = t >> 32;
        }
        out[i + b.len()] = carry as u32;
    }
    while out.last() == Some(&0) {
        out.pop();
    }
    out
}

/// Non-restoring bitwise long division of magnitudes.
/// Returns (quotient, remainder); the divisor must be non-zero.
pub(crate) fn div_abs(u: &[u32], v: &[u32]) -> (Vec<u32>, Vec<u32>) {
    debug_assert!(!v.is_empty());
    let mut q = vec![0u32; u.len()];
    let mut r = vec![0u32; v.len()];

    // Highest set bit of the dividend
    let mut nbits = u.len() * 32;
    while nbits > 0 && (u[(nbits - 1) / 32] >> ((nbits - 1) % 32)) & 1 == 0 {
        nbits -= 1;
    }

    for i in (0..nbits).rev() {
        // r = (r << 1) | bit(u, i)
        let mut carry: u32 = 0;
        for limb in r.iter_mut() {
            let shifted = ((*limb as u64) << 1) | carry as u64;
            *limb = shifted as u32;
            carry = (shifted >> 32) as u32;
        }
        r[0] |= (u[i / 32] >> (i % 32)) & 1;

        // r >= v? (an overflow carry always qualifies)
        let ge = if carry != 0 {
            true
        } else {
            let mut ge = true;
            for j in (0..v.len()).rev() {
                if r[j] != v[j] {
                    ge = r[j] > v[j];
                    break;
                }
            }
            ge
        };

        if ge {
            let mut borrow: i64 = 0;
            for j in 0..v.len() {
                let mut diff = r[j] as i64 - borrow - v[j] as i64;
                if diff < 0 {
                    diff += BASE as i64;
                    borrow = 1;
                } else {
                    borrow = 0;
                }
                r[j] = diff as u32;
            }
            q[i / 32] |= 1 << (i % 32);
        }
    }

    while q.last() == Some(&0) {
        q.pop();
    }
    while r.last() == Some(&0) {
        r.pop();
    }
    (q, r)
}

/// Decimal digits of a magnitude, most significant first. "0" for zero.
pub(crate) fn decimal_digits(limbs: &[u32]) -> String {
    if limbs.is_empty() {
        return "0".to_string();
    }
    let mut work = limbs.to_vec();
    let mut digits = Vec::new();
    while !work.is_empty() {
        // divide the whole magnitude by 10, most significant limb first
        let mut rem: u64 = 0;
        for limb in work.iter_mut().rev() {
            let cur = (rem << 32) | *limb as u64;
            *limb = (cur / 10) as u32;
            rem = cur % 10;
        }
        digits.push(b'0' + rem as u8);
        while work.last() == Some(&0) {
            work.pop();
        }
    }
    digits.reverse();
    String::from_utf8(digits).expect("digits are ASCII")
}

/// Magnitude times a small scalar plus a small addend, in place
pub(crate) fn mul_small_add(limbs: &mut Vec<u32>, factor: u32, addend: u32) {
    let mut carry = addend as u64;
    for limb in limbs.iter_mut() {
        let t = *limb as u64 * factor as u64 + carry;
        *limb = t as u32;
        carry = t >> 32;
    }
    while carry != 0 {
        limbs.push(carry as u32);
        carry >>= 32;
    }
}

/// 10^k as a magnitude, by binary exponentiation
pub(crate) fn pow10_abs(k: u64) -> Vec<u32> {
    let mut result = vec![1u32];
    let mut base = vec![10u32];
    let mut e = k;
    while e > 0 {
        if e & 1 == 1 {
            result = mul_abs(&result, &base);
        }
        e >>= 1;
        if e > 0 {
            base = mul_abs(&base, &base);
        }
    }
    result
}

impl BigInt {
    /// The canonical zero
    pub fn zero() -> Self {
        BigInt {
            sign: 1,
            limbs: Vec::new(),
        }
    }

    /// Convert from a machine integer, including `i64::MIN`
    pub fn from_i64(value: i64) -> Self {
        if value == 0 {
            return Self::zero();
        }
        let (sign, mag) = if value < 0 {
            (-1, (value as i128).unsigned_abs() as u64)
        } else {
            (1, value as u64)
        };
        let mut limbs = vec![mag as u32];
        if mag >> 32 != 0 {
            limbs.push((mag >> 32) as u32);
        }
        BigInt { sign, limbs }
    }

    /// Convert back to a machine integer if it fits
    pub fn to_i64(&self) -> Option<i64> {
        let mag: u64 = match self.limbs.len() {
            0 => 0,
            1 => self.limbs[0] as u64,
            2 => self.limbs[0] as u64 | (self.limbs[1] as u64) << 32,
            _ => return None,
        };
        if self.sign >= 0 {
            i64::try_from(mag).ok()
        } else if mag <= i64::MAX as u64 + 1 {
            Some((mag as i64).wrapping_neg())
        } else {
            None
        }
    }

    /// Whether this is zero
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.limbs.is_empty()
    }

    /// Addition with the usual sign matrix
    pub fn add(&self, other: &BigInt) -> BigInt {
        let (mut sign, mut limbs) = if self.sign == other.sign {
            (self.sign, add_abs(&self.limbs, &other.limbs))
        } else {
            match cmp_abs(&self.limbs, &other.limbs) {
                Ordering::Less => (other.sign, sub_abs(&other.limbs, &self.limbs)),
                _ => (self.sign, sub_abs(&self.limbs, &other.limbs)),
            }
        };
        normalize(&mut sign, &mut limbs);
        BigInt { sign, limbs }
    }

    /// Subtraction via the sign matrix
    pub fn sub(&self, other: &BigInt) -> BigInt {
        let negated = BigInt {
            sign: -other.sign,
            limbs: other.limbs.clone(),
        };
        self.add(&negated)
    }

    /// Schoolbook multiplication
    pub fn mul(&self, other: &BigInt) -> BigInt {
        let mut sign = self.sign * other.sign;
        let mut limbs = mul_abs(&self.limbs, &other.limbs);
        normalize(&mut sign, &mut limbs);
        BigInt { sign, limbs }
    }

    /// Quotient and remainder of truncated division. The remainder carries
    /// the dividend's sign.
    pub fn div_mod(&self, other: &BigInt) -> Result<(BigInt, BigInt), NumError> {
        if other.is_zero() {
            return Err(NumError::DivideByZero);
        }
        let (q_limbs, r_limbs) = div_abs(&self.limbs, &other.limbs);
        let mut q = BigInt {
            sign: self.sign * other.sign,
            limbs: q_limbs,
        };
        let mut r = BigInt {
            sign: self.sign,
            limbs: r_limbs,
        };
        normalize(&mut q.sign, &mut q.limbs);
        normalize(&mut r.sign, &mut r.limbs);
        Ok((q, r))
    }

    /// Floored modulo: the result is normalised toward the divisor's sign,
    /// so `a mod b` lies in `[0, |b|)` when `b > 0`.
    pub fn modulo(&self, other: &BigInt) -> Result<BigInt, NumError> {
        let (_, r) = self.div_mod(other)?;
        if !r.is_zero() && r.sign != other.sign {
            let mut out = BigInt {
                sign: other.sign,
                limbs: sub_abs(&other.limbs, &r.limbs),
            };
            normalize(&mut out.sign, &mut out.limbs);
            Ok(out)
        } else {
            Ok(r)
        }
    }

    /// Binary exponentiation by squaring. The exponent must be
    /// non-negative; a negative exponent would produce a BigFloat and the
    /// caller is expected to promote first.
    pub fn pow(&self, exp: i64) -> Result<BigInt, NumError> {
        if exp < 0 {
            return Err(NumError::NegativePower);
        }
        let mut result = BigInt::from_i64(1);
        let mut base = self.clone();
        let mut e = exp as u64;
        while e > 0 {
            if e & 1 == 1 {
                result = result.mul(&base);
            }
            e >>= 1;
            if e > 0 {
                base = base.mul(&base);
            }
        }
        Ok(result)
    }

    /// Three-valued comparison: sign first, then magnitude
    pub fn compare(&self, other: &BigInt) -> Ordering {
        if self.sign != other.sign {
            return self.sign.cmp(&other.sign);
        }
        let mag = cmp_abs(&self.limbs, &other.limbs);
        if self.sign >= 0 {
            mag
        } else {
            mag.reverse()
        }
    }

    /// Decimal rendering
    pub fn to_decimal(&self) -> String {
        let digits = decimal_digits(&self.limbs);
        if self.sign < 0 && !self.is_zero() {
            format!("-{digits}")
        } else {
            digits
        }
    }

    /// Parse a decimal literal with optional sign
    pub fn from_decimal(s: &str) -> Result<BigInt, NumError> {
        let s = s.trim();
        let (sign, digits) = match s.as_bytes().first() {
            Some(b'-') => (-1, &s[1..]),
            Some(b'+') => (1, &s[1..]),
            _ => (1, s),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(NumError::BadLiteral(s.to_string()));
        }
        let mut limbs = Vec::new();
        for byte in digits.bytes() {
            mul_small_add(&mut limbs, 10, (byte - b'0') as u32);
        }
        let mut sign = sign;
        normalize(&mut sign, &mut limbs);
        Ok(BigInt { sign, limbs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big(s: &str) -> BigInt {
        BigInt::from_decimal(s).unwrap()
    }

    #[test]
    fn test_from_i64_edges() {
        assert!(BigInt::from_i64(0).is_zero());
        assert_eq!(BigInt::from_i64(i64::MIN).to_decimal(), "-9223372036854775808");
        assert_eq!(BigInt::from_i64(i64::MIN).to_i64(), Some(i64::MIN));
        assert_eq!(BigInt::from_i64(i64::MAX).to_i64(), Some(i64::MAX));
    }

    #[test]
    fn test_two_to_the_hundred_round_trip() {
        let literal = "1267650600228229401496703205376"; // 2^100
        let n = big(literal);
        assert_eq!(n.to_decimal(), literal);

        // 2^99 + 2^99 == 2^100
        let half = BigInt::from_i64(2).pow(99).unwrap();
        assert_eq!(n.compare(&half.add(&half)), Ordering::Equal);
    }

    #[test]
    fn test_sign_matrix() {
        assert_eq!(big("5").add(&big("-3")).to_decimal(), "2");
        assert_eq!(big("-5").add(&big("3")).to_decimal(), "-2");
        assert_eq!(big("3").sub(&big("5")).to_decimal(), "-2");
        assert_eq!(big("-3").sub(&big("-5")).to_decimal(), "2");
    }

    #[test]
    fn test_add_sub_cancels() {
        let a = big("123456789012345678901234567890");
        let b = big("-98765432109876543210");
        assert_eq!(a.add(&b).sub(&b), a);
        assert_eq!(a.sub(&a), BigInt::zero());
    }

    #[test]
    fn test_mul_zero_annihilates() {
        let a = big("123456789012345678901234567890");
        assert_eq!(a.mul(&BigInt::zero()), BigInt::zero());
        assert_eq!(BigInt::zero().mul(&a), BigInt::zero());
    }

    #[test]
    fn test_mul_carries() {
        let a = big("4294967295"); // 2^32 - 1
        assert_eq!(a.mul(&a).to_decimal(), "18446744065119617025");
    }

    #[test]
    fn test_div_mod() {
        let (q, r) = big("100").div_mod(&big("7")).unwrap();
        assert_eq!(q.to_decimal(), "14");
        assert_eq!(r.to_decimal(), "2");

        // remainder carries the dividend's sign
        let (q, r) = big("-100").div_mod(&big("7")).unwrap();
        assert_eq!(q.to_decimal(), "-14");
        assert_eq!(r.to_decimal(), "-2");

        let big_num = big("340282366920938463463374607431768211456"); // 2^128
        let (q, r) = big_num.div_mod(&big("18446744073709551616")).unwrap(); // 2^64
        assert_eq!(q.to_decimal(), "18446744073709551616");
        assert!(r.is_zero());
    }

    #[test]
    fn test_modulo_lands_in_divisor_range() {
        // (a mod b) in [0, |b|) for b > 0
        assert_eq!(big("-100").modulo(&big("7")).unwrap().to_decimal(), "5");
        assert_eq!(big("100").modulo(&big("7")).unwrap().to_decimal(), "2");
        assert_eq!(big("100").modulo(&big("-7")).unwrap().to_decimal(), "-5");
    }

    #[test]
    fn test_divide_by_zero() {
        assert_eq!(
            big("1").div_mod(&BigInt::zero()).unwrap_err(),
            NumError::DivideByZero
        );
    }

    #[test]
    fn test_negative_power_rejected() {
        assert_eq!(big("2").pow(-1).unwrap_err(), NumError::NegativePower);
    }

    #[test]
    fn test_compare_antisymmetric() {
        let a = big("-12345678901234567890");
        let b = big("42");
        assert_eq!(a.compare(&b), b.compare(&a).reverse());
        assert_eq!(a.compare(&a), Ordering::Equal);
        // both negative: magnitude order flips
        assert_eq!(big("-10").compare(&big("-2")), Ordering::Less);
    }

    #[test]
    fn test_bad_literal() {
        assert!(BigInt::from_decimal("12x3").is_err());
        assert!(BigInt::from_decimal("").is_err());
        assert!(BigInt::from_decimal("-").is_err());
    }
}
