//! Kinked interest rate model and continuous accrual

use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};

use crate::{
    error::{LendingError, Result},
    market::Market,
};

/// Seconds per year (365 days)
pub const SECONDS_PER_YEAR: i64 = 31_536_000;

pub const MILLIS_PER_YEAR: i64 = SECONDS_PER_YEAR * 1_000;

/// Rates derived from a market's utilization
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketRates {
    pub utilization: Decimal,
    pub supply_apy: Decimal,
    pub borrow_apy: Decimal,
}

impl MarketRates {
    pub const ZERO: MarketRates = MarketRates {
        utilization: Decimal::ZERO,
        supply_apy: Decimal::ZERO,
        borrow_apy: Decimal::ZERO,
    };
}

pub struct InterestRateModel;

impl InterestRateModel {
    /// Borrowed / supplied, zero for an empty market
    pub fn utilization(market: &Market) -> Decimal {
        if market.total_supplied.is_zero() {
            return Decimal::ZERO;
        }
        market
            .total_borrowed
            .checked_div(market.total_supplied)
            .unwrap_or(Decimal::ZERO)
    }

    /// Piecewise linear borrow rate with a kink at optimal utilization:
    /// - below: base + slope1 * (u / optimal)
    /// - above: base + slope1 + slope2 * ((u - optimal) / (1 - optimal))
    ///
    /// Supply rate = borrow rate * u * (1 - reserve factor)
    pub fn compute_rates(market: &Market) -> Result<MarketRates> {
        let optimal = market.optimal_utilization;
        if optimal <= Decimal::ZERO || optimal >= Decimal::ONE {
            return Err(LendingError::InvalidMarketState {
                asset: market.asset_id.clone(),
                reason: format!("optimal utilization {} must be strictly between 0 and 1", optimal),
            });
        }

        let utilization = Self::utilization(market);

        let borrow_apy = if utilization <= optimal {
            let ratio = utilization.checked_div(optimal).ok_or(LendingError::MathOverflow)?;
            market.base_rate + market.slope1 * ratio
        } else {
            let excess = (utilization - optimal)
                .checked_div(Decimal::ONE - optimal)
                .ok_or(LendingError::MathOverflow)?;
            market.base_rate + market.slope1 + market.slope2 * excess
        };

        let supply_apy = borrow_apy * utilization * (Decimal::ONE - market.reserve_factor);

        Ok(MarketRates {
            utilization,
            supply_apy,
            borrow_apy,
        })
    }
}

/// Continuous compounding factor `exp(rate * elapsed / year)`
pub fn accrual_factor(rate: Decimal, elapsed_millis: i64) -> Result<Decimal> {
    if elapsed_millis <= 0 || rate.is_zero() {
        return Ok(Decimal::ONE);
    }

    let exponent = rate
        .checked_mul(Decimal::from(elapsed_millis))
        .and_then(|v| v.checked_div(Decimal::from(MILLIS_PER_YEAR)))
        .ok_or(LendingError::MathOverflow)?;

    exponent.checked_exp().ok_or(LendingError::MathOverflow)
}

/// Grow `balance` by the accrual factor
pub fn compound(balance: Decimal, rate: Decimal, elapsed_millis: i64) -> Result<Decimal> {
    if balance.is_zero() {
        return Ok(balance);
    }
    balance
        .checked_mul(accrual_factor(rate, elapsed_millis)?)
        .ok_or(LendingError::MathOverflow)
}
