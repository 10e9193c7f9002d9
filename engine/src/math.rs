//! Checked `Decimal` arithmetic
//!
//! Balances are user supplied, so every sum and product that can grow one
//! goes through these traits and fails with `MathOverflow` instead of
//! panicking.

use rust_decimal::Decimal;

use crate::error::{LendingError, Result};

/// Try to add, return an error on overflow
pub trait TryAdd: Sized {
    fn try_add(self, rhs: Self) -> Result<Self>;
}

/// Try to subtract, return an error on overflow
pub trait TrySub: Sized {
    fn try_sub(self, rhs: Self) -> Result<Self>;
}

/// Try to multiply, return an error on overflow
pub trait TryMul<Rhs = Self>: Sized {
    fn try_mul(self, rhs: Rhs) -> Result<Self>;
}

/// Try to divide, return an error on overflow or divide by zero
pub trait TryDiv<Rhs = Self>: Sized {
    fn try_div(self, rhs: Rhs) -> Result<Self>;
}

impl TryAdd for Decimal {
    fn try_add(self, rhs: Self) -> Result<Self> {
        self.checked_add(rhs).ok_or(LendingError::MathOverflow)
    }
}

impl TrySub for Decimal {
    fn try_sub(self, rhs: Self) -> Result<Self> {
        self.checked_sub(rhs).ok_or(LendingError::MathOverflow)
    }
}

impl TryMul for Decimal {
    fn try_mul(self, rhs: Self) -> Result<Self> {
        self.checked_mul(rhs).ok_or(LendingError::MathOverflow)
    }
}

impl TryDiv for Decimal {
    fn try_div(self, rhs: Self) -> Result<Self> {
        self.checked_div(rhs).ok_or(LendingError::MathOverflow)
    }
}

/// Checked sum of an iterator of amounts
pub fn try_sum<I>(values: I) -> Result<Decimal>
where
    I: IntoIterator<Item = Decimal>,
{
    values.into_iter().try_fold(Decimal::ZERO, <Decimal as TryAdd>::try_add)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_is_an_error() {
        assert_eq!(Decimal::MAX.try_add(Decimal::ONE), Err(LendingError::MathOverflow));
        assert_eq!(Decimal::MIN.try_sub(Decimal::ONE), Err(LendingError::MathOverflow));
        assert_eq!(Decimal::MAX.try_mul(Decimal::TWO), Err(LendingError::MathOverflow));
        assert_eq!(Decimal::ONE.try_div(Decimal::ZERO), Err(LendingError::MathOverflow));
        assert_eq!(Decimal::from(6).try_div(Decimal::from(4)), Ok(Decimal::new(15, 1)));
    }

    #[test]
    fn test_try_sum() {
        assert_eq!(try_sum([Decimal::ONE, Decimal::TWO]), Ok(Decimal::from(3)));
        assert_eq!(try_sum([Decimal::MAX, Decimal::ONE]), Err(LendingError::MathOverflow));
    }
}
