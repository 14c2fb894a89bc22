//! BigNum engine
//!
//! Total arithmetic over [`BigInt`] and [`BigFloat`] plus their
//! conversions with machine integers, floats, and decimal strings. Mixed
//! BigInt/BigFloat arithmetic promotes the integer operand to a BigFloat.
//!
//! The structures here are pure data; the `State`-level entry points
//! allocate results in the big-number arenas and keep every intermediate
//! anchored on the operand scratch stack until it is rooted, so a
//! collection triggered by an allocation can never reclaim a value that is
//! still being built.

pub mod bigfloat;
pub mod bigint;

pub use bigfloat::BigFloat;
pub use bigint::BigInt;

use std::cmp::Ordering;

use crate::error::NumError;

/// A big number of either representation, used by the polymorphic
/// arithmetic entry points
#[derive(Debug, Clone, PartialEq)]
pub enum Big {
    Int(BigInt),
    Float(BigFloat),
}

impl Big {
    /// View as a BigFloat, promoting integers
    fn promoted(&self) -> BigFloat {
        match self {
            Big::Int(i) => BigFloat::from_bigint(i),
            Big::Float(f) => f.clone(),
        }
    }

    /// Addition with promotion
    pub fn add(&self, other: &Big) -> Big {
        match (self, other) {
            (Big::Int(a), Big::Int(b)) => Big::Int(a.add(b)),
            _ => Big::Float(self.promoted().add(&other.promoted())),
        }
    }

    /// Subtraction with promotion
    pub fn sub(&self, other: &Big) -> Big {
        match (self, other) {
            (Big::Int(a), Big::Int(b)) => Big::Int(a.sub(b)),
            _ => Big::Float(self.promoted().sub(&other.promoted())),
        }
    }

    /// Multiplication with promotion
    pub fn mul(&self, other: &Big) -> Big {
        match (self, other) {
            (Big::Int(a), Big::Int(b)) => Big::Int(a.mul(b)),
            _ => Big::Float(self.promoted().mul(&other.promoted())),
        }
    }

    /// Division. Integer pairs divide truncated; any float operand
    /// promotes to a BigFloat division.
    pub fn div(&self, other: &Big) -> Result<Big, NumError> {
        match (self, other) {
            (Big::Int(a), Big::Int(b)) => Ok(Big::Int(a.div_mod(b)?.0)),
            _ => Ok(Big::Float(self.promoted().div(&other.promoted())?)),
        }
    }

    /// Floored modulo; defined for integer pairs only
    pub fn modulo(&self, other: &Big) -> Result<Big, NumError> {
        match (self, other) {
            (Big::Int(a), Big::Int(b)) => Ok(Big::Int(a.modulo(b)?)),
            _ => Err(NumError::NotANumber),
        }
    }

    /// Integer-exponent power
    pub fn pow(&self, exp: i64) -> Result<Big, NumError> {
        match self {
            Big::Int(a) => Ok(Big::Int(a.pow(exp)?)),
            Big::Float(a) => Ok(Big::Float(a.pow(exp)?)),
        }
    }

    /// Three-valued comparison with promotion
    pub fn compare(&self, other: &Big) -> Ordering {
        match (self, other) {
            (Big::Int(a), Big::Int(b)) => a.compare(b),
            _ => self.promoted().compare(&other.promoted()),
        }
    }

    /// Decimal rendering
    pub fn to_decimal(&self) -> String {
        match self {
            Big::Int(i) => i.to_decimal(),
            Big::Float(f) => f.to_decimal(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_arithmetic_promotes() {
        let i = Big::Int(BigInt::from_i64(3));
        let f = Big::Float(BigFloat::from_string("0.5").unwrap());
        match i.add(&f) {
            Big::Float(r) => {
                assert_eq!(
                    r.compare(&BigFloat::from_string("3.5").unwrap()),
                    Ordering::Equal
                );
            }
            other => panic!("expected promotion to BigFloat, got {other:?}"),
        }
    }

    #[test]
    fn test_integer_pairs_stay_integers() {
        let a = Big::Int(BigInt::from_i64(10));
        let b = Big::Int(BigInt::from_i64(4));
        assert_eq!(a.div(&b).unwrap(), Big::Int(BigInt::from_i64(2)));
        assert_eq!(a.modulo(&b).unwrap(), Big::Int(BigInt::from_i64(2)));
    }

    #[test]
    fn test_compare_promoted() {
        let a = Big::Int(BigInt::from_i64(2));
        let b = Big::Float(BigFloat::from_string("2.0").unwrap());
        assert_eq!(a.compare(&b), Ordering::Equal);
    }
}
