//! Asset registry and per-asset market aggregates

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::MarketConfig,
    error::{LendingError, Result},
    interest::{compound, MarketRates},
    math::{TryAdd, TryMul, TrySub},
    types::AssetId,
};

/// Immutable asset listing. Prices come from the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub symbol: String,
    pub name: String,
    pub decimals: u32,
    pub collateral_factor: Decimal,
    pub max_leverage: Decimal,
}

impl Asset {
    pub fn from_config(config: &MarketConfig) -> Self {
        Self {
            id: config.id.clone(),
            symbol: config.symbol.clone(),
            name: config.name.clone(),
            decimals: config.decimals,
            collateral_factor: config.collateral_factor,
            max_leverage: config.max_leverage,
        }
    }

    /// Truncate to the asset's native precision
    pub fn round_down(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.decimals, RoundingStrategy::ToZero)
    }

    pub fn round_up(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.decimals, RoundingStrategy::AwayFromZero)
    }
}

/// Listed assets keyed by id
#[derive(Debug, Clone, Default)]
pub struct AssetRegistry {
    assets: BTreeMap<AssetId, Asset>,
}

impl AssetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, asset: Asset) {
        self.assets.insert(asset.id.clone(), asset);
    }

    pub fn get(&self, id: &AssetId) -> Result<&Asset> {
        self.assets.get(id).ok_or_else(|| LendingError::UnknownAsset(id.clone()))
    }

    pub fn contains(&self, id: &AssetId) -> bool {
        self.assets.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Asset> {
        self.assets.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &AssetId> {
        self.assets.keys()
    }
}

/// Pool aggregate for one asset.
///
/// `total_borrowed <= total_supplied` holds after every committed action;
/// `reserves` is the protocol-owned part of `total_supplied`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub asset_id: AssetId,
    pub total_supplied: Decimal,
    pub total_borrowed: Decimal,
    pub reserves: Decimal,
    pub reserve_factor: Decimal,
    pub base_rate: Decimal,
    pub slope1: Decimal,
    pub slope2: Decimal,
    pub optimal_utilization: Decimal,
    pub last_accrual: DateTime<Utc>,
}

impl Market {
    pub fn from_config(config: &MarketConfig, now: DateTime<Utc>) -> Self {
        Self {
            asset_id: config.id.clone(),
            total_supplied: Decimal::ZERO,
            total_borrowed: Decimal::ZERO,
            reserves: Decimal::ZERO,
            reserve_factor: config.reserve_factor,
            base_rate: config.base_rate,
            slope1: config.slope1,
            slope2: config.slope2,
            optimal_utilization: config.optimal_utilization,
            last_accrual: now,
        }
    }

    /// Unborrowed cash held by the pool
    pub fn available_liquidity(&self) -> Decimal {
        (self.total_supplied - self.total_borrowed).max(Decimal::ZERO)
    }

    /// Capitalize borrow interest since the last accrual.
    ///
    /// Interest owed by borrowers is an asset of the pool, so it grows both
    /// totals; the reserve factor share is booked to reserves. Returns the
    /// interest accrued. `last_accrual` advances by exactly the time accrued.
    pub fn accrue_interest(&mut self, rates: &MarketRates, now: DateTime<Utc>) -> Result<Decimal> {
        let elapsed = (now - self.last_accrual).num_milliseconds();
        if elapsed <= 0 {
            return Ok(Decimal::ZERO);
        }

        let grown = compound(self.total_borrowed, rates.borrow_apy, elapsed)?;
        let interest = grown.try_sub(self.total_borrowed)?;

        self.total_supplied = self.total_supplied.try_add(interest)?;
        self.reserves = self.reserves.try_add(interest.try_mul(self.reserve_factor)?)?;
        self.total_borrowed = grown;
        self.last_accrual += Duration::milliseconds(elapsed);

        if !interest.is_zero() {
            debug!(
                asset = %self.asset_id,
                elapsed_ms = elapsed,
                interest = %interest,
                "Market interest accrued"
            );
        }

        Ok(interest)
    }

    pub fn record_supply(&mut self, amount: Decimal) -> Result<()> {
        self.total_supplied = self.total_supplied.try_add(amount)?;
        Ok(())
    }

    /// Remove supplied funds; fails when the cash is lent out
    pub fn release_supply(&mut self, amount: Decimal) -> Result<()> {
        let available = self.available_liquidity();
        if amount > available {
            return Err(LendingError::InsufficientLiquidity {
                requested: amount,
                available,
            });
        }
        self.total_supplied -= amount;
        Ok(())
    }

    pub fn record_borrow(&mut self, amount: Decimal) -> Result<()> {
        let available = self.available_liquidity();
        if amount > available {
            return Err(LendingError::InsufficientLiquidity {
                requested: amount,
                available,
            });
        }
        self.total_borrowed = self.total_borrowed.try_add(amount)?;
        Ok(())
    }

    /// Position balances and the market aggregate accrue separately, so a
    /// full repayment can exceed the aggregate by rounding dust.
    pub fn record_repay(&mut self, amount: Decimal) -> Result<()> {
        self.total_borrowed = self.total_borrowed.try_sub(amount)?.max(Decimal::ZERO);
        Ok(())
    }

    /// Book a fee to the pool
    pub fn record_fee(&mut self, fee: Decimal) -> Result<()> {
        self.total_supplied = self.total_supplied.try_add(fee)?;
        self.reserves = self.reserves.try_add(fee)?;
        Ok(())
    }

    pub fn check_invariants(&self) -> Result<()> {
        if self.total_borrowed > self.total_supplied {
            return Err(LendingError::InvalidMarketState {
                asset: self.asset_id.clone(),
                reason: format!(
                    "borrowed {} exceeds supplied {}",
                    self.total_borrowed, self.total_supplied
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::default_markets, interest::InterestRateModel};

    #[test]
    fn test_release_supply_respects_cash() {
        let mut market = Market::from_config(&default_markets()[1], Utc::now());
        market.record_supply(Decimal::from(1000)).unwrap();
        market.record_borrow(Decimal::from(900)).unwrap();

        let err = market.release_supply(Decimal::from(200)).unwrap_err();
        assert!(matches!(err, LendingError::InsufficientLiquidity { .. }));

        market.release_supply(Decimal::from(100)).unwrap();
        assert_eq!(market.available_liquidity(), Decimal::ZERO);
        assert!(market.check_invariants().is_ok());
    }

    #[test]
    fn test_accrual_preserves_solvency() {
        let start = Utc::now();
        let mut market = Market::from_config(&default_markets()[1], start);
        market.record_supply(Decimal::from(1000)).unwrap();
        market.record_borrow(Decimal::from(1000)).unwrap();

        let rates = InterestRateModel::compute_rates(&market).unwrap();
        let interest = market
            .accrue_interest(&rates, start + Duration::days(365))
            .unwrap();

        assert!(interest > Decimal::ZERO);
        assert_eq!(market.total_supplied, market.total_borrowed);
        assert_eq!(market.reserves, interest * market.reserve_factor);
        assert!(market.check_invariants().is_ok());
    }

    #[test]
    fn test_accrual_keeps_sub_second_remainder() {
        let start = Utc::now();
        let mut stepped = Market::from_config(&default_markets()[1], start);
        stepped.record_supply(Decimal::from(1_000_000)).unwrap();
        stepped.record_borrow(Decimal::from(1_000_000)).unwrap();
        let mut single = stepped.clone();
        let rates = InterestRateModel::compute_rates(&stepped).unwrap();

        stepped.accrue_interest(&rates, start + Duration::milliseconds(1_500)).unwrap();
        stepped.accrue_interest(&rates, start + Duration::milliseconds(3_000)).unwrap();
        single.accrue_interest(&rates, start + Duration::seconds(3)).unwrap();

        assert_eq!(stepped.last_accrual, start + Duration::seconds(3));
        let drift = (stepped.total_borrowed - single.total_borrowed).abs();
        assert!(drift < Decimal::new(1, 9), "drift {drift}");
    }

    #[test]
    fn test_supply_overflow_is_an_error() {
        let mut market = Market::from_config(&default_markets()[2], Utc::now());
        market.record_supply(Decimal::MAX).unwrap();

        assert_eq!(market.record_supply(Decimal::ONE), Err(LendingError::MathOverflow));
        assert_eq!(market.record_fee(Decimal::ONE), Err(LendingError::MathOverflow));
        assert_eq!(market.total_supplied, Decimal::MAX);
    }

    #[test]
    fn test_asset_rounding() {
        let usdc = Asset::from_config(&default_markets()[1]);
        let raw = Decimal::new(1_234_567_89, 8);
        assert_eq!(usdc.round_down(raw), Decimal::new(1_234_567, 6));
        assert_eq!(usdc.round_up(raw), Decimal::new(1_234_568, 6));
    }
}
