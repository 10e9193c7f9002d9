//! Per-account position records

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    interest::{compound, MarketRates},
    types::{AccountId, AssetId},
};

/// Balances of one account in one asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub account_id: AccountId,
    pub asset_id: AssetId,
    pub supplied_amount: Decimal,
    pub borrowed_amount: Decimal,
    pub last_accrual: DateTime<Utc>,
}

impl Position {
    pub fn new(account_id: AccountId, asset_id: AssetId, now: DateTime<Utc>) -> Self {
        Self {
            account_id,
            asset_id,
            supplied_amount: Decimal::ZERO,
            borrowed_amount: Decimal::ZERO,
            last_accrual: now,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.supplied_amount.is_zero() && self.borrowed_amount.is_zero()
    }

    /// Capitalize supply and borrow interest up to `now`
    pub fn accrue(&mut self, rates: &MarketRates, now: DateTime<Utc>) -> Result<()> {
        let elapsed = (now - self.last_accrual).num_milliseconds();
        if elapsed <= 0 {
            return Ok(());
        }

        self.supplied_amount = compound(self.supplied_amount, rates.supply_apy, elapsed)?;
        self.borrowed_amount = compound(self.borrowed_amount, rates.borrow_apy, elapsed)?;
        self.last_accrual += Duration::milliseconds(elapsed);
        Ok(())
    }
}

/// Preset minimum health factors an account can opt into
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyTemplate {
    /// Configured engine default
    #[default]
    Standard,
    /// 1.25
    Balanced,
    /// 1.5
    Conservative,
    Custom(Decimal),
}

impl StrategyTemplate {
    /// Effective minimum: never below the engine default
    pub fn min_health_factor(&self, default: Decimal) -> Decimal {
        let preset = match self {
            StrategyTemplate::Standard => default,
            StrategyTemplate::Balanced => Decimal::new(125, 2),
            StrategyTemplate::Conservative => Decimal::new(15, 1),
            StrategyTemplate::Custom(value) => *value,
        };
        preset.max(default)
    }
}

/// All positions of one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBook {
    pub account_id: AccountId,
    pub positions: BTreeMap<AssetId, Position>,
    #[serde(default)]
    pub strategy: StrategyTemplate,
}

impl AccountBook {
    pub fn new(account_id: AccountId) -> Self {
        Self {
            account_id,
            positions: BTreeMap::new(),
            strategy: StrategyTemplate::default(),
        }
    }

    pub fn position(&self, asset: &AssetId) -> Option<&Position> {
        self.positions.get(asset)
    }

    /// Position for `asset`, created on first touch
    pub fn position_mut(&mut self, asset: &AssetId, now: DateTime<Utc>) -> &mut Position {
        let account_id = &self.account_id;
        self.positions
            .entry(asset.clone())
            .or_insert_with(|| Position::new(account_id.clone(), asset.clone(), now))
    }

    pub fn supplied(&self, asset: &AssetId) -> Decimal {
        self.position(asset).map(|p| p.supplied_amount).unwrap_or(Decimal::ZERO)
    }

    pub fn borrowed(&self, asset: &AssetId) -> Decimal {
        self.position(asset).map(|p| p.borrowed_amount).unwrap_or(Decimal::ZERO)
    }

    pub fn has_debt(&self) -> bool {
        self.positions.values().any(|p| p.borrowed_amount > Decimal::ZERO)
    }

    pub fn asset_ids(&self) -> impl Iterator<Item = &AssetId> {
        self.positions.keys()
    }

    /// Drop positions whose balances both reached zero
    pub fn prune(&mut self) {
        self.positions.retain(|_, p| !p.is_empty());
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_never_lowers_default() {
        let default = Decimal::new(11, 1);
        assert_eq!(StrategyTemplate::Standard.min_health_factor(default), default);
        assert_eq!(StrategyTemplate::Balanced.min_health_factor(default), Decimal::new(125, 2));
        assert_eq!(StrategyTemplate::Conservative.min_health_factor(Decimal::ONE), Decimal::new(15, 1));
        assert_eq!(StrategyTemplate::Custom(Decimal::ONE).min_health_factor(default), default);
    }

    #[test]
    fn test_positions_created_and_pruned() {
        let now = Utc::now();
        let eth = AssetId::from("ETH");
        let mut book = AccountBook::new(AccountId::from("alice"));

        book.position_mut(&eth, now).supplied_amount = Decimal::from(5);
        assert_eq!(book.supplied(&eth), Decimal::from(5));
        assert!(!book.has_debt());

        book.position_mut(&eth, now).supplied_amount = Decimal::ZERO;
        book.prune();
        assert!(book.is_empty());
    }

    #[test]
    fn test_accrual_skips_zero_elapsed() {
        let now = Utc::now();
        let mut position = Position::new(AccountId::from("alice"), AssetId::from("USDC"), now);
        position.borrowed_amount = Decimal::from(100);
        let rates = MarketRates {
            utilization: Decimal::ONE,
            supply_apy: Decimal::new(5, 2),
            borrow_apy: Decimal::new(1, 1),
        };

        position.accrue(&rates, now).unwrap();
        assert_eq!(position.borrowed_amount, Decimal::from(100));

        position.accrue(&rates, now + Duration::milliseconds(400)).unwrap();
        assert!(position.borrowed_amount > Decimal::from(100));
        assert_eq!(position.last_accrual, now + Duration::milliseconds(400));

        position.accrue(&rates, now + Duration::days(365)).unwrap();
        assert!(position.borrowed_amount > Decimal::from(110));
    }
}
