//! Token amounts with explicitly checked arithmetic.
//!
//! Every balance, share count and fee in the consensus state is a
//! [`Quantity`]: a non-negative integer backed by `u128`. All operations are
//! checked — overflow, underflow and division by zero are deterministic
//! errors that the caller must handle, never panics and never silent
//! wrap-around. The same inputs therefore produce the same error on every
//! node.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by [`Quantity`] arithmetic.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QuantityError {
    #[error("quantity: insufficient balance")]
    InsufficientBalance,

    #[error("quantity: arithmetic overflow")]
    Overflow,

    #[error("quantity: division by zero")]
    DivideByZero,
}

/// An unsigned token amount.
///
/// Serializes as a plain integer so the CBOR form is byte-stable across
/// implementations.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(u128);

impl Quantity {
    /// The zero amount.
    pub const ZERO: Quantity = Quantity(0);

    pub const fn new(value: u128) -> Self {
        Quantity(value)
    }

    pub const fn value(&self) -> u128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// In-place checked addition.
    pub fn add(&mut self, other: &Quantity) -> Result<(), QuantityError> {
        self.0 = self.0.checked_add(other.0).ok_or(QuantityError::Overflow)?;
        Ok(())
    }

    /// In-place checked subtraction. Fails without mutating `self` when the
    /// subtrahend exceeds the current value.
    pub fn sub(&mut self, other: &Quantity) -> Result<(), QuantityError> {
        self.0 = self
            .0
            .checked_sub(other.0)
            .ok_or(QuantityError::InsufficientBalance)?;
        Ok(())
    }

    /// In-place checked multiplication.
    pub fn mul(&mut self, other: &Quantity) -> Result<(), QuantityError> {
        self.0 = self.0.checked_mul(other.0).ok_or(QuantityError::Overflow)?;
        Ok(())
    }

    /// In-place integer division.
    pub fn quo(&mut self, other: &Quantity) -> Result<(), QuantityError> {
        if other.0 == 0 {
            return Err(QuantityError::DivideByZero);
        }
        self.0 /= other.0;
        Ok(())
    }

    /// Returns `self * mul / div` without mutating, the pattern used by all
    /// share-price and pro-rata computations. Multiplies first so precision
    /// is only lost in the final division.
    pub fn mul_quo(&self, mul: &Quantity, div: &Quantity) -> Result<Quantity, QuantityError> {
        let mut q = *self;
        q.mul(mul)?;
        q.quo(div)?;
        Ok(q)
    }

    /// Checked addition returning the sum.
    pub fn checked_add(&self, other: &Quantity) -> Result<Quantity, QuantityError> {
        let mut q = *self;
        q.add(other)?;
        Ok(q)
    }
}

impl From<u128> for Quantity {
    fn from(value: u128) -> Self {
        Quantity(value)
    }
}

impl From<u64> for Quantity {
    fn from(value: u64) -> Self {
        Quantity(value as u128)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Moves `amount` from `src` to `dst`. Fails without mutating either side
/// when `src` holds less than `amount`.
pub fn move_amount(
    dst: &mut Quantity,
    src: &mut Quantity,
    amount: &Quantity,
) -> Result<(), QuantityError> {
    if *src < *amount {
        return Err(QuantityError::InsufficientBalance);
    }
    // Check the destination first so a failure leaves both sides untouched.
    let new_dst = dst.checked_add(amount)?;
    src.sub(amount)?;
    *dst = new_dst;
    Ok(())
}

/// Moves up to `amount` from `src` to `dst`, saturating at the source
/// balance. Returns the amount actually moved.
pub fn move_up_to(
    dst: &mut Quantity,
    src: &mut Quantity,
    amount: &Quantity,
) -> Result<Quantity, QuantityError> {
    let moved = if *src < *amount { *src } else { *amount };
    if moved.is_zero() {
        return Ok(Quantity::ZERO);
    }
    move_amount(dst, src, &moved)?;
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sub_roundtrip() {
        let mut q = Quantity::new(100);
        q.add(&Quantity::new(50)).unwrap();
        assert_eq!(q, Quantity::new(150));
        q.sub(&Quantity::new(150)).unwrap();
        assert!(q.is_zero());
    }

    #[test]
    fn sub_underflow_is_error_and_leaves_value() {
        let mut q = Quantity::new(10);
        assert_eq!(
            q.sub(&Quantity::new(11)),
            Err(QuantityError::InsufficientBalance)
        );
        assert_eq!(q, Quantity::new(10));
    }

    #[test]
    fn add_overflow_is_error() {
        let mut q = Quantity::new(u128::MAX);
        assert_eq!(q.add(&Quantity::new(1)), Err(QuantityError::Overflow));
    }

    #[test]
    fn mul_quo_multiplies_first() {
        // 10 * 3 / 4 = 7 with multiply-first, 8 with divide-first rounding.
        let q = Quantity::new(10);
        let r = q.mul_quo(&Quantity::new(3), &Quantity::new(4)).unwrap();
        assert_eq!(r, Quantity::new(7));
    }

    #[test]
    fn quo_by_zero_is_error() {
        let mut q = Quantity::new(5);
        assert_eq!(q.quo(&Quantity::ZERO), Err(QuantityError::DivideByZero));
    }

    #[test]
    fn move_amount_all_or_nothing() {
        let mut src = Quantity::new(100);
        let mut dst = Quantity::new(5);
        move_amount(&mut dst, &mut src, &Quantity::new(40)).unwrap();
        assert_eq!(src, Quantity::new(60));
        assert_eq!(dst, Quantity::new(45));

        assert_eq!(
            move_amount(&mut dst, &mut src, &Quantity::new(61)),
            Err(QuantityError::InsufficientBalance)
        );
        assert_eq!(src, Quantity::new(60));
        assert_eq!(dst, Quantity::new(45));
    }

    #[test]
    fn move_up_to_saturates_at_source() {
        let mut src = Quantity::new(30);
        let mut dst = Quantity::ZERO;
        let moved = move_up_to(&mut dst, &mut src, &Quantity::new(100)).unwrap();
        assert_eq!(moved, Quantity::new(30));
        assert!(src.is_zero());
        assert_eq!(dst, Quantity::new(30));

        let moved = move_up_to(&mut dst, &mut src, &Quantity::new(100)).unwrap();
        assert!(moved.is_zero());
    }
}
