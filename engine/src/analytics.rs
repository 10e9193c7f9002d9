//! Protocol-wide statistics and risk scans

use futures::future::try_join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    engine::{LendingEngine, Mode},
    error::{LendingError, Result},
    health::HealthEngine,
    math::{TryAdd, TryMul, TrySub},
    types::{AccountId, AssetId, HealthFactor},
};

/// Aggregates across every market, valued in USD
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketStats {
    pub total_supplied_usd: Decimal,
    pub total_borrowed_usd: Decimal,
    /// Unborrowed liquidity
    pub tvl_usd: Decimal,
    pub reserves_usd: Decimal,
    pub active_accounts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationCandidate {
    pub account_id: AccountId,
    pub health_factor: HealthFactor,
    pub collateral_value_usd: Decimal,
    pub debt_value_usd: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_health_factor(health_factor: HealthFactor) -> Self {
        if health_factor.is_below(Decimal::new(11, 1)) {
            RiskLevel::High
        } else if health_factor.is_below(Decimal::new(15, 1)) {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressTestResult {
    pub account_id: AccountId,
    pub price_drop_pct: Decimal,
    pub current_health_factor: HealthFactor,
    pub new_health_factor: HealthFactor,
    /// Market value of supplied assets before the drop
    pub collateral_value_usd: Decimal,
    pub portfolio_loss_usd: Decimal,
    pub liquidation_risk: RiskLevel,
    /// Risk-adjusted collateral to add to get back to the account minimum
    pub additional_collateral_required_usd: Decimal,
}

impl LendingEngine {
    pub async fn market_stats(&self) -> Result<MarketStats> {
        let ids = self.market_ids();
        let refs: Vec<&AssetId> = ids.iter().collect();

        let mut stats = self
            .execute(&[], &refs, Mode::ReadOnly, |ledger| {
                let mut stats = MarketStats {
                    total_supplied_usd: Decimal::ZERO,
                    total_borrowed_usd: Decimal::ZERO,
                    tvl_usd: Decimal::ZERO,
                    reserves_usd: Decimal::ZERO,
                    active_accounts: 0,
                };
                for id in &ids {
                    let market = ledger.market(id)?;
                    let price = ledger.prices().price(id)?;
                    stats.total_supplied_usd = stats.total_supplied_usd.try_add(market.total_supplied.try_mul(price)?)?;
                    stats.total_borrowed_usd = stats.total_borrowed_usd.try_add(market.total_borrowed.try_mul(price)?)?;
                    stats.tvl_usd = stats.tvl_usd.try_add(market.available_liquidity().try_mul(price)?)?;
                    stats.reserves_usd = stats.reserves_usd.try_add(market.reserves.try_mul(price)?)?;
                }
                Ok(stats)
            })
            .await?;

        let positions = try_join_all(
            self.account_ids()
                .into_iter()
                .map(|id| async move { self.get_account_position(&id).await }),
        )
        .await?;
        stats.active_accounts = positions
            .iter()
            .filter(|view| !view.collateral.assets.is_empty() || !view.borrowed.assets.is_empty())
            .count();

        Ok(stats)
    }

    /// Accounts eligible for liquidation, least healthy first
    pub async fn liquidatable_accounts(&self) -> Result<Vec<LiquidationCandidate>> {
        let scans = self.account_ids().into_iter().map(|id| async move {
            self.execute(&[&id], &[], Mode::ReadOnly, |ledger| {
                let health = ledger.health(&id)?;
                Ok(health.is_liquidatable().then(|| LiquidationCandidate {
                    account_id: id.clone(),
                    health_factor: health.health_factor,
                    collateral_value_usd: health.collateral_value_usd,
                    debt_value_usd: health.debt_value_usd,
                }))
            })
            .await
        });

        let mut candidates: Vec<LiquidationCandidate> = try_join_all(scans).await?.into_iter().flatten().collect();
        candidates.sort_by(|a, b| {
            a.health_factor
                .cmp(&b.health_factor)
                .then_with(|| a.account_id.cmp(&b.account_id))
        });

        debug!(candidates = candidates.len(), "Liquidation scan complete");
        Ok(candidates)
    }

    /// Re-value an account with collateral prices cut by `price_drop_pct`
    /// percent. Only `asset` is shocked when given, otherwise every
    /// collateral asset. Debt keeps current prices.
    pub async fn stress_test(
        &self,
        account: &AccountId,
        price_drop_pct: Decimal,
        asset: Option<&AssetId>,
    ) -> Result<StressTestResult> {
        if price_drop_pct < Decimal::ZERO || price_drop_pct > Decimal::ONE_HUNDRED {
            return Err(LendingError::InvalidAmount(price_drop_pct));
        }
        if let Some(asset) = asset {
            self.asset_registry().get(asset)?;
        }
        let factor = Decimal::ONE - price_drop_pct / Decimal::ONE_HUNDRED;

        self.execute(&[account], &[], Mode::ReadOnly, |ledger| {
            let book = ledger.account(account)?;
            let prices = ledger.prices();
            let shocked = match asset {
                Some(asset) => prices.with_scaled(asset, factor),
                None => prices.with_scaled_all(factor),
            };

            let current = ledger.health(account)?;
            let stressed = HealthEngine::compute_with(book, ledger.assets(), &shocked, prices)?;

            let mut collateral_value_usd = Decimal::ZERO;
            let mut stressed_value_usd = Decimal::ZERO;
            for position in book.positions.values() {
                let amount = position.supplied_amount;
                collateral_value_usd = collateral_value_usd.try_add(amount.try_mul(prices.price(&position.asset_id)?)?)?;
                stressed_value_usd = stressed_value_usd.try_add(amount.try_mul(shocked.price(&position.asset_id)?)?)?;
            }

            let minimum = ledger.min_health_factor(account)?;
            let required = stressed
                .debt_value_usd
                .try_mul(minimum)?
                .try_sub(stressed.collateral_value_usd)?;

            Ok(StressTestResult {
                account_id: account.clone(),
                price_drop_pct,
                current_health_factor: current.health_factor,
                new_health_factor: stressed.health_factor,
                collateral_value_usd,
                portfolio_loss_usd: collateral_value_usd.try_sub(stressed_value_usd)?,
                liquidation_risk: RiskLevel::from_health_factor(stressed.health_factor),
                additional_collateral_required_usd: required.max(Decimal::ZERO),
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_levels() {
        assert_eq!(RiskLevel::from_health_factor(HealthFactor::Finite(Decimal::ONE)), RiskLevel::High);
        assert_eq!(RiskLevel::from_health_factor(HealthFactor::Finite(Decimal::new(14, 1))), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_health_factor(HealthFactor::Finite(Decimal::new(15, 1))), RiskLevel::Low);
        assert_eq!(RiskLevel::from_health_factor(HealthFactor::Unbounded), RiskLevel::Low);
    }
}
