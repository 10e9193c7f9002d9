//! Account valuation and health factor

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    market::AssetRegistry,
    math::{TryAdd, TryDiv, TryMul},
    oracle::PriceSnapshot,
    position::AccountBook,
    types::HealthFactor,
};

/// Valuation of one account at a price snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountHealth {
    /// Supplied value weighted by collateral factors
    pub collateral_value_usd: Decimal,
    pub debt_value_usd: Decimal,
    pub health_factor: HealthFactor,
}

impl AccountHealth {
    pub fn is_liquidatable(&self) -> bool {
        self.health_factor.is_liquidatable()
    }
}

pub struct HealthEngine;

impl HealthEngine {
    pub fn compute(book: &AccountBook, assets: &AssetRegistry, prices: &PriceSnapshot) -> Result<AccountHealth> {
        Self::compute_with(book, assets, prices, prices)
    }

    /// Value collateral and debt against separate price sets
    pub fn compute_with(
        book: &AccountBook,
        assets: &AssetRegistry,
        collateral_prices: &PriceSnapshot,
        debt_prices: &PriceSnapshot,
    ) -> Result<AccountHealth> {
        let mut collateral_value_usd = Decimal::ZERO;
        let mut debt_value_usd = Decimal::ZERO;

        for position in book.positions.values() {
            if position.supplied_amount > Decimal::ZERO {
                let asset = assets.get(&position.asset_id)?;
                let price = collateral_prices.price(&position.asset_id)?;
                let value = position
                    .supplied_amount
                    .try_mul(price)?
                    .try_mul(asset.collateral_factor)?;
                collateral_value_usd = collateral_value_usd.try_add(value)?;
            }

            if position.borrowed_amount > Decimal::ZERO {
                let price = debt_prices.price(&position.asset_id)?;
                let value = position.borrowed_amount.try_mul(price)?;
                debt_value_usd = debt_value_usd.try_add(value)?;
            }
        }

        Ok(AccountHealth {
            collateral_value_usd,
            debt_value_usd,
            health_factor: Self::health_factor(collateral_value_usd, debt_value_usd)?,
        })
    }

    /// `collateral / debt`, unbounded without debt
    pub fn health_factor(collateral_value_usd: Decimal, debt_value_usd: Decimal) -> Result<HealthFactor> {
        if debt_value_usd <= Decimal::ZERO {
            return Ok(HealthFactor::Unbounded);
        }
        collateral_value_usd.try_div(debt_value_usd).map(HealthFactor::Finite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::default_markets,
        error::LendingError,
        market::Asset,
        types::{AccountId, AssetId},
    };
    use chrono::Utc;

    fn registry() -> AssetRegistry {
        let mut registry = AssetRegistry::new();
        for config in default_markets() {
            registry.insert(Asset::from_config(&config));
        }
        registry
    }

    fn prices(eth: i64) -> PriceSnapshot {
        PriceSnapshot::from_prices([
            (AssetId::from("ETH"), Decimal::from(eth)),
            (AssetId::from("USDC"), Decimal::ONE),
        ])
    }

    fn borrower() -> AccountBook {
        let now = Utc::now();
        let mut book = AccountBook::new(AccountId::from("alice"));
        book.position_mut(&AssetId::from("ETH"), now).supplied_amount = Decimal::from(5);
        book.position_mut(&AssetId::from("USDC"), now).borrowed_amount = Decimal::from(10_000);
        book
    }

    #[test]
    fn test_health_factor_example() {
        // 5 ETH * 3500 * 0.8 = 14000 against 10000 debt
        let health = HealthEngine::compute(&borrower(), &registry(), &prices(3500)).unwrap();
        assert_eq!(health.collateral_value_usd, Decimal::from(14_000));
        assert_eq!(health.debt_value_usd, Decimal::from(10_000));
        assert_eq!(health.health_factor, HealthFactor::Finite(Decimal::new(14, 1)));
    }

    #[test]
    fn test_exactly_one_is_not_liquidatable() {
        let health = HealthEngine::compute(&borrower(), &registry(), &prices(2500)).unwrap();
        assert_eq!(health.health_factor, HealthFactor::Finite(Decimal::ONE));
        assert!(!health.is_liquidatable());

        let health = HealthEngine::compute(&borrower(), &registry(), &prices(2499)).unwrap();
        assert!(health.is_liquidatable());
    }

    #[test]
    fn test_no_debt_is_unbounded() {
        let mut book = AccountBook::new(AccountId::from("bob"));
        book.position_mut(&AssetId::from("ETH"), Utc::now()).supplied_amount = Decimal::ONE;

        let health = HealthEngine::compute(&book, &registry(), &prices(3500)).unwrap();
        assert_eq!(health.health_factor, HealthFactor::Unbounded);
        assert!(!health.is_liquidatable());
    }

    #[test]
    fn test_overflowing_valuation_is_an_error() {
        let mut book = borrower();
        book.position_mut(&AssetId::from("ETH"), Utc::now()).supplied_amount = Decimal::MAX;

        let result = HealthEngine::compute(&book, &registry(), &prices(3500));
        assert_eq!(result, Err(LendingError::MathOverflow));
    }

    #[test]
    fn test_missing_price_propagates() {
        let result = HealthEngine::compute(&borrower(), &registry(), &PriceSnapshot::default());
        assert!(matches!(result, Err(LendingError::OracleUnavailable { .. })));
    }
}
