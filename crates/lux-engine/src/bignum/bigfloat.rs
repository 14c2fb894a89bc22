//! Arbitrary-precision decimal floats
//!
//! A `BigFloat` is `sign * mantissa * 10^exp`, with the mantissa held in
//! base-2^32 limbs and a decimal exponent. The canonical zero has no
//! limbs, positive sign, and exponent zero. Non-zero values need not strip
//! trailing base-10 zeros from the mantissa; `from_string(to_string(x))`
//! reproduces `x` exactly regardless.

use std::cmp::Ordering;

use crate::error::NumError;

use super::bigint::{
    add_abs, cmp_abs, decimal_digits, div_abs, mul_abs, mul_small_add, pow10_abs, sub_abs, BigInt,
};

/// Significant digits used by the default display rendering
pub const DISPLAY_DIGITS: usize = 14;

/// log2(10), used by the comparison fast path
const LOG2_10: f64 = 3.3219;

/// An arbitrary-precision decimal float
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigFloat {
    /// -1 or +1; +1 for zero
    pub sign: i8,
    /// Mantissa magnitude, little-endian base-2^32
    pub limbs: Vec<u32>,
    /// Decimal exponent
    pub exp: i64,
}

fn normalize(f: &mut BigFloat) {
    while f.limbs.last() == Some(&0) {
        f.limbs.pop();
    }
    if f.limbs.is_empty() {
        f.sign = 1;
        f.exp = 0;
    }
}

impl BigFloat {
    /// The canonical zero
    pub fn zero() -> Self {
        BigFloat {
            sign: 1,
            limbs: Vec::new(),
            exp: 0,
        }
    }

    /// Whether this is zero
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.limbs.is_empty()
    }

    /// Promote a BigInt (exponent zero)
    pub fn from_bigint(n: &BigInt) -> Self {
        let mut f = BigFloat {
            sign: n.sign,
            limbs: n.limbs.clone(),
            exp: 0,
        };
        normalize(&mut f);
        f
    }

    /// Convert from a machine integer
    pub fn from_i64(value: i64) -> Self {
        Self::from_bigint(&BigInt::from_i64(value))
    }

    /// Convert from a double via its shortest decimal rendering
    pub fn from_f64(value: f64) -> Result<Self, NumError> {
        if !value.is_finite() {
            return Err(NumError::NotANumber);
        }
        Self::from_string(&format!("{value:e}"))
    }

    /// `self * 10^k` computed on the mantissa; the exponent drops by `k`
    /// so the value is preserved. Used to align operands at a common
    /// exponent before mantissa arithmetic.
    pub fn scaled(&self, k: u64) -> BigFloat {
        if k == 0 || self.is_zero() {
            return self.clone();
        }
        let mut f = BigFloat {
            sign: self.sign,
            limbs: mul_abs(&self.limbs, &pow10_abs(k)),
            exp: self.exp - k as i64,
        };
        normalize(&mut f);
        f
    }

    /// Align two operands at their minimum exponent, returning the scaled
    /// mantissa pair plus the shared exponent
    fn aligned(&self, other: &BigFloat) -> (Vec<u32>, Vec<u32>, i64) {
        let min_e = self.exp.min(other.exp);
        let a = if self.exp > min_e {
            mul_abs(&self.limbs, &pow10_abs((self.exp - min_e) as u64))
        } else {
            self.limbs.clone()
        };
        let b = if other.exp > min_e {
            mul_abs(&other.limbs, &pow10_abs((other.exp - min_e) as u64))
        } else {
            other.limbs.clone()
        };
        (a, b, min_e)
    }

    /// Addition: align exponents, then the usual sign matrix on mantissas
    pub fn add(&self, other: &BigFloat) -> BigFloat {
        let (a, b, exp) = self.aligned(other);
        let (sign, limbs) = if self.sign == other.sign {
            (self.sign, add_abs(&a, &b))
        } else {
            match cmp_abs(&a, &b) {
                Ordering::Less => (other.sign, sub_abs(&b, &a)),
                _ => (self.sign, sub_abs(&a, &b)),
            }
        };
        let mut f = BigFloat { sign, limbs, exp };
        normalize(&mut f);
        f
    }

    /// Subtraction via the sign matrix
    pub fn sub(&self, other: &BigFloat) -> BigFloat {
        let negated = BigFloat {
            sign: -other.sign,
            limbs: other.limbs.clone(),
            exp: other.exp,
        };
        self.add(&negated)
    }

    /// Multiplication: mantissas multiply, exponents add
    pub fn mul(&self, other: &BigFloat) -> BigFloat {
        let mut f = BigFloat {
            sign: self.sign * other.sign,
            limbs: mul_abs(&self.limbs, &other.limbs),
            exp: self.exp + other.exp,
        };
        normalize(&mut f);
        f
    }

    /// Division with a target precision derived from the wider operand's
    /// limb count plus a safety margin. The dividend is pre-scaled by
    /// `10^k` so the integer quotient keeps that precision.
    pub fn div(&self, other: &BigFloat) -> Result<BigFloat, NumError> {
        if other.is_zero() {
            return Err(NumError::DivideByZero);
        }
        if self.is_zero() {
            return Ok(BigFloat::zero());
        }

        let prec_limbs = self.limbs.len().max(other.limbs.len()).max(4) + 4;
        let bits1 = self.limbs.len() as i64 * 32;
        let bits2 = other.limbs.len() as i64 * 32;
        let needed_bits = prec_limbs as i64 * 32 - bits1 + bits2;
        let k = if needed_bits > 0 {
            (needed_bits as f64 * 0.30103) as u64 + 2
        } else {
            0
        };

        let scaled = if k > 0 {
            mul_abs(&self.limbs, &pow10_abs(k))
        } else {
            self.limbs.clone()
        };
        let (q, _r) = div_abs(&scaled, &other.limbs);

        let mut f = BigFloat {
            sign: self.sign * other.sign,
            limbs: q,
            exp: self.exp - other.exp - k as i64,
        };
        normalize(&mut f);
        Ok(f)
    }

    /// Binary exponentiation by squaring; non-negative exponents only
    pub fn pow(&self, exp: i64) -> Result<BigFloat, NumError> {
        if exp < 0 {
            return Err(NumError::NegativePower);
        }
        let mut result = BigFloat::from_i64(1);
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

    /// Three-valued comparison: sign first, then a fast magnitude check,
    /// then an exponent-aligning rescale.
    ///
    /// The fast path estimates each magnitude as `limbs*32 + exp*log2(10)`
    /// bits and decides without rescaling when the difference exceeds 64
    /// bits.
    pub fn compare(&self, other: &BigFloat) -> Ordering {
        match (self.is_zero(), other.is_zero()) {
            (true, true) => return Ordering::Equal,
            (true, false) => {
                return if other.sign > 0 {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (false, true) => {
                return if self.sign > 0 {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (false, false) => {}
        }
        if self.sign != other.sign {
            return self.sign.cmp(&other.sign);
        }

        let mag1 = self.limbs.len() as f64 * 32.0 + self.exp as f64 * LOG2_10;
        let mag2 = other.limbs.len() as f64 * 32.0 + other.exp as f64 * LOG2_10;
        let mag = if (mag1 - mag2).abs() > 64.0 {
            if mag1 > mag2 {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        } else {
            let (a, b, _) = self.aligned(other);
            cmp_abs(&a, &b)
        };

        if self.sign > 0 {
            mag
        } else {
            mag.reverse()
        }
    }

    /// Exact rendering: mantissa digits plus an explicit `e<exp>` suffix
    pub fn to_decimal(&self) -> String {
        if self.is_zero() {
            return "0".to_string();
        }
        let digits = decimal_digits(&self.limbs);
        let sign = if self.sign < 0 { "-" } else { "" };
        if self.exp == 0 {
            format!("{sign}{digits}")
        } else {
            format!("{sign}{digits}e{}", self.exp)
        }
    }

    /// Default display: scientific notation truncated to
    /// [`DISPLAY_DIGITS`] significant digits, trailing zeros stripped.
    /// Values that differ only below the display precision render equal.
    pub fn to_display(&self) -> String {
        if self.is_zero() {
            return "0".to_string();
        }
        let digits = decimal_digits(&self.limbs);
        let sci_exp = digits.len() as i64 - 1 + self.exp;

        let mut sig: String = digits.chars().take(DISPLAY_DIGITS).collect();
        while sig.len() > 1 && sig.ends_with('0') {
            sig.pop();
        }

        let sign = if self.sign < 0 { "-" } else { "" };
        let (head, tail) = sig.split_at(1);
        let mantissa = if tail.is_empty() {
            head.to_string()
        } else {
            format!("{head}.{tail}")
        };
        if sci_exp == 0 {
            format!("{sign}{mantissa}")
        } else {
            format!("{sign}{mantissa}e{sci_exp}")
        }
    }

    /// Fixed-precision rendering: integer part, `.`, and exactly
    /// `precision` fractional digits, inserting leading/trailing zeros as
    /// the exponent requires. Digits beyond the stored mantissa truncate.
    pub fn to_string_prec(&self, precision: usize) -> String {
        if self.is_zero() {
            return if precision > 0 {
                format!("0.{}", "0".repeat(precision))
            } else {
                "0".to_string()
            };
        }

        let digits = decimal_digits(&self.limbs);
        let sign = if self.sign < 0 { "-" } else { "" };

        if self.exp >= 0 {
            // pure integer: append exp zeros
            let mut out = format!("{sign}{digits}{}", "0".repeat(self.exp as usize));
            if precision > 0 {
                out.push('.');
                out.push_str(&"0".repeat(precision));
            }
            return out;
        }

        // decimal point sits -exp digits from the right of the digit string
        let decimal_pos = digits.len() as i64 + self.exp;
        let mut out = String::from(sign);

        if decimal_pos > 0 {
            out.push_str(&digits[..decimal_pos as usize]);
        } else {
            out.push('0');
        }

        if precision > 0 {
            out.push('.');
            let mut written = 0usize;
            if decimal_pos < 0 {
                let lead = (-decimal_pos) as usize;
                let take = lead.min(precision);
                out.push_str(&"0".repeat(take));
                written += take;
            }
            if written < precision {
                let start = decimal_pos.max(0) as usize;
                if start < digits.len() {
                    let avail = &digits[start..];
                    let take = avail.len().min(precision - written);
                    out.push_str(&avail[..take]);
                    written += take;
                }
            }
            if written < precision {
                out.push_str(&"0".repeat(precision - written));
            }
        }
        out
    }

    /// Parse `[sign] digits [. digits] [e[sign]digits]`, accumulating the
    /// mantissa digit-by-digit and adjusting the exponent by the count of
    /// fractional digits plus the explicit exponent.
    pub fn from_string(s: &str) -> Result<BigFloat, NumError> {
        let trimmed = s.trim();
        let mut bytes = trimmed.bytes().peekable();

        let mut sign: i8 = 1;
        match bytes.peek() {
            Some(b'-') => {
                sign = -1;
                bytes.next();
            }
            Some(b'+') => {
                bytes.next();
            }
            _ => {}
        }

        let mut limbs: Vec<u32> = Vec::new();
        let mut exp: i64 = 0;
        let mut has_dot = false;
        let mut saw_digit = false;

        while let Some(&b) = bytes.peek() {
            match b {
                b'0'..=b'9' => {
                    bytes.next();
                    mul_small_add(&mut limbs, 10, (b - b'0') as u32);
                    saw_digit = true;
                    if has_dot {
                        exp -= 1;
                    }
                }
                b'.' if !has_dot => {
                    bytes.next();
                    has_dot = true;
                }
                b'e' | b'E' => {
                    bytes.next();
                    let mut e_sign: i64 = 1;
                    match bytes.peek() {
                        Some(b'-') => {
                            e_sign = -1;
                            bytes.next();
                        }
                        Some(b'+') => {
                            bytes.next();
                        }
                        _ => {}
                    }
                    let mut e_val: i64 = 0;
                    let mut saw_exp_digit = false;
                    while let Some(&d) = bytes.peek() {
                        if !d.is_ascii_digit() {
                            break;
                        }
                        bytes.next();
                        e_val = e_val * 10 + (d - b'0') as i64;
                        saw_exp_digit = true;
                    }
                    if !saw_exp_digit {
                        return Err(NumError::BadLiteral(trimmed.to_string()));
                    }
                    exp += e_sign * e_val;
                    break;
                }
                _ => break,
            }
        }

        if !saw_digit {
            return Err(NumError::BadLiteral(trimmed.to_string()));
        }

        let mut f = BigFloat { sign, limbs, exp };
        normalize(&mut f);
        Ok(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bf(s: &str) -> BigFloat {
        BigFloat::from_string(s).unwrap()
    }

    #[test]
    fn test_parse_shapes() {
        assert_eq!(bf("0"), BigFloat::zero());
        assert_eq!(bf("-0"), BigFloat::zero());
        assert_eq!(bf("12.5").exp, -1);
        assert_eq!(bf("1e100").exp, 100);
        assert_eq!(bf("2.5e-3").exp, -4);
        assert!(BigFloat::from_string("abc").is_err());
        assert!(BigFloat::from_string("1e").is_err());
    }

    #[test]
    fn test_to_string_round_trip() {
        for s in ["0", "1", "-12.5", "1e100", "3.14159", "-2.5e-40"] {
            let f = bf(s);
            assert_eq!(BigFloat::from_string(&f.to_decimal()).unwrap(), f, "{s}");
        }
    }

    #[test]
    fn test_absorption_at_display_precision() {
        let huge = bf("1e100");
        let one = bf("1");

        let sum = huge.add(&one);
        // exact values differ...
        assert_ne!(sum, huge);
        // ...but render identically at default display precision
        assert_eq!(sum.to_display(), huge.to_display());

        // and the difference is recovered exactly
        let diff = sum.sub(&huge);
        assert_eq!(diff.compare(&one), Ordering::Equal);
    }

    #[test]
    fn test_add_aligns_exponents() {
        let a = bf("1.5e2"); // 150
        let b = bf("25e-1"); // 2.5
        let sum = a.add(&b);
        assert_eq!(sum.compare(&bf("152.5")), Ordering::Equal);
    }

    #[test]
    fn test_sub_signs() {
        assert_eq!(bf("2.5").sub(&bf("4")).compare(&bf("-1.5")), Ordering::Equal);
        assert_eq!(bf("-2").sub(&bf("-3.5")).compare(&bf("1.5")), Ordering::Equal);
    }

    #[test]
    fn test_mul() {
        assert_eq!(bf("1.5").mul(&bf("-2")).compare(&bf("-3")), Ordering::Equal);
        assert_eq!(
            bf("1e50").mul(&bf("1e-50")).compare(&bf("1")),
            Ordering::Equal
        );
    }

    #[test]
    fn test_div_precision() {
        let q = bf("1").div(&bf("8")).unwrap();
        assert_eq!(q.compare(&bf("0.125")), Ordering::Equal);

        let third = bf("1").div(&bf("3")).unwrap();
        // 1/3 to at least a dozen digits
        assert_eq!(&third.to_string_prec(12), "0.333333333333");
    }

    #[test]
    fn test_div_by_zero() {
        assert_eq!(
            bf("1").div(&BigFloat::zero()).unwrap_err(),
            NumError::DivideByZero
        );
    }

    #[test]
    fn test_compare_fast_path() {
        // magnitudes differ by far more than 64 bits: no rescale needed
        assert_eq!(bf("1e100").compare(&bf("1e-100")), Ordering::Greater);
        assert_eq!(bf("-1e100").compare(&bf("-1e-100")), Ordering::Less);
        // close magnitudes force the aligned comparison
        assert_eq!(bf("1.000001").compare(&bf("1.000002")), Ordering::Less);
        assert_eq!(bf("10").compare(&bf("1e1")), Ordering::Equal);
    }

    #[test]
    fn test_compare_antisymmetric() {
        let a = bf("3.25");
        let b = bf("-7e3");
        assert_eq!(a.compare(&b), b.compare(&a).reverse());
    }

    #[test]
    fn test_fixed_precision_rendering() {
        assert_eq!(bf("12.3").to_string_prec(2), "12.30");
        assert_eq!(bf("0.00123").to_string_prec(5), "0.00123");
        assert_eq!(bf("123").to_string_prec(0), "123");
        assert_eq!(bf("1e3").to_string_prec(1), "1000.0");
        assert_eq!(BigFloat::zero().to_string_prec(2), "0.00");
    }

    #[test]
    fn test_from_f64() {
        let f = BigFloat::from_f64(2.5).unwrap();
        assert_eq!(f.compare(&bf("2.5")), Ordering::Equal);
        assert!(BigFloat::from_f64(f64::NAN).is_err());
        assert!(BigFloat::from_f64(f64::INFINITY).is_err());
    }

    #[test]
    fn test_pow() {
        let two = BigFloat::from_i64(2);
        assert_eq!(
            two.pow(10).unwrap().compare(&bf("1024")),
            Ordering::Equal
        );
        assert_eq!(two.pow(0).unwrap().compare(&bf("1")), Ordering::Equal);
        assert!(two.pow(-1).is_err());
    }
}
