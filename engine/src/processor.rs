//! Action validation and application against a staged ledger
//!
//! Everything here is synchronous and runs while the engine holds the
//! account and market locks. A returned error means the staged ledger is
//! discarded.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::RiskParameters,
    error::{LendingError, Result},
    health::HealthEngine,
    ledger::PositionLedger,
    market::AssetRegistry,
    math::{TryAdd, TryDiv, TryMul, TrySub},
    oracle::PriceSnapshot,
    types::{AccountId, AssetId, HealthFactor},
};

/// Balance-changing action kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Deposit,
    Withdraw,
    Borrow,
    Repay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub account_id: AccountId,
    pub asset_id: AssetId,
    pub amount: Decimal,
}

impl ActionRequest {
    pub fn new(kind: ActionKind, account_id: impl Into<AccountId>, asset_id: impl Into<AssetId>, amount: Decimal) -> Self {
        Self {
            kind,
            account_id: account_id.into(),
            asset_id: asset_id.into(),
            amount,
        }
    }
}

/// Outcome of a committed action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReceipt {
    pub success: bool,
    pub new_health_factor: HealthFactor,
    pub action_id: Uuid,
    pub executed_at: DateTime<Utc>,
}

impl ActionReceipt {
    pub fn committed(new_health_factor: HealthFactor, executed_at: DateTime<Utc>) -> Self {
        Self {
            success: true,
            new_health_factor,
            action_id: Uuid::new_v4(),
            executed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationRequest {
    pub liquidator_id: AccountId,
    pub target_account_id: AccountId,
    pub collateral_asset_id: AssetId,
    pub debt_asset_id: AssetId,
    pub repay_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationResult {
    pub liquidation_id: Uuid,
    pub liquidator_id: AccountId,
    pub target_account_id: AccountId,
    pub collateral_asset_id: AssetId,
    pub debt_asset_id: AssetId,
    pub repaid_amount: Decimal,
    pub seized_collateral: Decimal,
    /// USD value of bonus-inclusive collateral the target could not cover
    pub bad_debt_usd: Decimal,
    pub health_factor_before: HealthFactor,
    pub health_factor_after: HealthFactor,
    pub executed_at: DateTime<Utc>,
}

/// Callback that receives flash-loaned funds.
///
/// Returns the amount handed back to the pool, which must cover
/// `amount + fee`. The receiver runs while the market is locked and has no
/// access to the engine.
pub trait FlashLoanReceiver {
    fn execute_operation(&mut self, asset: &AssetId, amount: Decimal, fee: Decimal) -> Result<Decimal>;
}

impl<F> FlashLoanReceiver for F
where
    F: FnMut(&AssetId, Decimal, Decimal) -> Result<Decimal>,
{
    fn execute_operation(&mut self, asset: &AssetId, amount: Decimal, fee: Decimal) -> Result<Decimal> {
        self(asset, amount, fee)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashLoanReceipt {
    pub loan_id: Uuid,
    pub account_id: AccountId,
    pub asset_id: AssetId,
    pub amount: Decimal,
    pub fee: Decimal,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeverageRequest {
    pub account_id: AccountId,
    pub collateral_asset_id: AssetId,
    pub collateral_amount: Decimal,
    pub borrow_asset_id: AssetId,
    pub leverage: Decimal,
}

/// Projection of a leveraged position, ignoring the account's other holdings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeveragePreview {
    pub collateral_value_usd: Decimal,
    pub position_size_usd: Decimal,
    pub borrow_value_usd: Decimal,
    pub borrow_amount: Decimal,
    pub health_factor: HealthFactor,
    /// Collateral price at which the position reaches a health factor of 1
    pub liquidation_price_usd: Option<Decimal>,
}

/// Unwind of a leveraged position: the whole borrow of `borrow_asset_id`
/// and all supplied `collateral_asset_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseLeverageRequest {
    pub account_id: AccountId,
    pub collateral_asset_id: AssetId,
    pub borrow_asset_id: AssetId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeverageUnwind {
    pub repaid_amount: Decimal,
    pub withdrawn_collateral: Decimal,
    pub health_factor: HealthFactor,
}

pub struct ActionProcessor;

impl ActionProcessor {
    /// Apply a deposit, withdraw, borrow or repay
    pub fn apply(ledger: &mut PositionLedger<'_>, request: &ActionRequest) -> Result<HealthFactor> {
        let ActionRequest {
            kind,
            account_id,
            asset_id,
            amount,
        } = request;

        match kind {
            ActionKind::Deposit => ledger.apply_deposit(account_id, asset_id, *amount)?,
            ActionKind::Withdraw => ledger.apply_withdraw(account_id, asset_id, *amount)?,
            ActionKind::Borrow => ledger.apply_borrow(account_id, asset_id, *amount)?,
            ActionKind::Repay => ledger.apply_repay(account_id, asset_id, *amount)?,
        }

        Ok(ledger.health(account_id)?.health_factor)
    }

    /// Repay part of an unhealthy account's debt in exchange for its
    /// collateral plus the liquidation bonus.
    ///
    /// The liquidator pays out of their supplied balance of the debt asset.
    /// Seized collateral is rounded down to the asset's decimals and capped at
    /// what the target holds; any uncovered remainder is reported as bad debt.
    pub fn liquidate(
        ledger: &mut PositionLedger<'_>,
        risk: &RiskParameters,
        request: &LiquidationRequest,
    ) -> Result<LiquidationResult> {
        let LiquidationRequest {
            liquidator_id,
            target_account_id,
            collateral_asset_id,
            debt_asset_id,
            repay_amount,
        } = request;
        let repay_amount = *repay_amount;

        if liquidator_id == target_account_id {
            return Err(LendingError::SelfLiquidation);
        }
        if repay_amount <= Decimal::ZERO {
            return Err(LendingError::InvalidAmount(repay_amount));
        }

        let before = ledger.health(target_account_id)?;
        if !before.is_liquidatable() {
            warn!(
                account = %target_account_id,
                health_factor = %before.health_factor,
                "Rejected liquidation of healthy account"
            );
            return Err(LendingError::PositionHealthy {
                account: target_account_id.clone(),
                health_factor: before.health_factor,
            });
        }

        let target = ledger.account(target_account_id)?;
        let debt = target.borrowed(debt_asset_id);
        if repay_amount > debt {
            return Err(LendingError::RepayExceedsDebt {
                requested: repay_amount,
                max: debt,
            });
        }

        let max_repay = if before.health_factor.is_below(risk.full_liquidation_threshold) {
            debt
        } else {
            debt.try_mul(risk.close_factor)?
        };
        if repay_amount > max_repay {
            return Err(LendingError::RepayExceedsDebt {
                requested: repay_amount,
                max: max_repay,
            });
        }

        let target_collateral = target.supplied(collateral_asset_id);
        if target_collateral.is_zero() {
            return Err(LendingError::CollateralNotFound {
                account: target_account_id.clone(),
                asset: collateral_asset_id.clone(),
            });
        }

        let collateral_asset = ledger.asset(collateral_asset_id)?;
        let debt_price = ledger.prices().price(debt_asset_id)?;
        let collateral_price = ledger.prices().price(collateral_asset_id)?;

        // repay * debtPrice * (1 + bonus) / collateralPrice
        let owed_collateral = collateral_asset.round_down(
            repay_amount
                .try_mul(debt_price)?
                .try_mul(Decimal::ONE + risk.liquidation_bonus)?
                .try_div(collateral_price)?,
        );
        let seized_collateral = owed_collateral.min(target_collateral);
        let bad_debt_usd = owed_collateral.try_sub(seized_collateral)?.try_mul(collateral_price)?;

        ledger.settle_debt_from_supply(liquidator_id, target_account_id, debt_asset_id, repay_amount)?;
        if seized_collateral > Decimal::ZERO {
            ledger.transfer_supply(target_account_id, liquidator_id, collateral_asset_id, seized_collateral)?;
        }

        ledger.ensure_min_health(liquidator_id, |health_factor, minimum| LendingError::WithdrawalUnsafe {
            health_factor,
            minimum,
        })?;

        let after = ledger.health(target_account_id)?;

        if bad_debt_usd > Decimal::ZERO {
            warn!(
                account = %target_account_id,
                asset = %collateral_asset_id,
                bad_debt_usd = %bad_debt_usd,
                "Liquidation left bad debt"
            );
        }

        info!(
            liquidator = %liquidator_id,
            account = %target_account_id,
            repaid = %repay_amount,
            seized = %seized_collateral,
            health_factor = %after.health_factor,
            "Liquidation staged"
        );

        Ok(LiquidationResult {
            liquidation_id: Uuid::new_v4(),
            liquidator_id: liquidator_id.clone(),
            target_account_id: target_account_id.clone(),
            collateral_asset_id: collateral_asset_id.clone(),
            debt_asset_id: debt_asset_id.clone(),
            repaid_amount: repay_amount,
            seized_collateral,
            bad_debt_usd,
            health_factor_before: before.health_factor,
            health_factor_after: after.health_factor,
            executed_at: ledger.now(),
        })
    }

    /// Lend unborrowed pool cash for the duration of `receiver`
    pub fn flash_loan<R>(
        ledger: &mut PositionLedger<'_>,
        fee_rate: Decimal,
        account_id: &AccountId,
        asset_id: &AssetId,
        amount: Decimal,
        receiver: &mut R,
    ) -> Result<FlashLoanReceipt>
    where
        R: FlashLoanReceiver + ?Sized,
    {
        if amount <= Decimal::ZERO {
            return Err(LendingError::InvalidAmount(amount));
        }

        let asset = ledger.asset(asset_id)?;
        let available = ledger.market(asset_id)?.available_liquidity();
        if amount > available {
            return Err(LendingError::InsufficientLiquidity {
                requested: amount,
                available,
            });
        }

        let fee = asset.round_up(amount.try_mul(fee_rate)?);
        let owed = amount.try_add(fee)?;
        let repaid = receiver.execute_operation(asset_id, amount, fee)?;
        if repaid < owed {
            warn!(account = %account_id, asset = %asset_id, owed = %owed, repaid = %repaid, "Flash loan not repaid");
            return Err(LendingError::FlashLoanNotRepaid { owed, repaid });
        }

        ledger.market_mut(asset_id)?.record_fee(fee)?;

        Ok(FlashLoanReceipt {
            loan_id: Uuid::new_v4(),
            account_id: account_id.clone(),
            asset_id: asset_id.clone(),
            amount,
            fee,
            executed_at: ledger.now(),
        })
    }

    pub fn preview_leverage(
        assets: &AssetRegistry,
        prices: &PriceSnapshot,
        request: &LeverageRequest,
    ) -> Result<LeveragePreview> {
        let collateral = assets.get(&request.collateral_asset_id)?;
        let borrow = assets.get(&request.borrow_asset_id)?;

        if request.collateral_amount <= Decimal::ZERO {
            return Err(LendingError::InvalidAmount(request.collateral_amount));
        }
        if request.leverage <= Decimal::ONE || request.leverage > collateral.max_leverage {
            return Err(LendingError::InvalidLeverage {
                requested: request.leverage,
                max: collateral.max_leverage,
            });
        }

        let collateral_price = prices.price(&collateral.id)?;
        let borrow_price = prices.price(&borrow.id)?;

        let collateral_value_usd = request.collateral_amount.try_mul(collateral_price)?;
        let position_size_usd = collateral_value_usd.try_mul(request.leverage)?;
        let target_borrow_usd = collateral_value_usd.try_mul(request.leverage - Decimal::ONE)?;
        let borrow_amount = borrow.round_down(target_borrow_usd.try_div(borrow_price)?);
        let borrow_value_usd = borrow_amount.try_mul(borrow_price)?;

        let risk_adjusted = collateral_value_usd.try_mul(collateral.collateral_factor)?;
        let health_factor = HealthEngine::health_factor(risk_adjusted, borrow_value_usd)?;
        let weight = request.collateral_amount.try_mul(collateral.collateral_factor)?;
        let liquidation_price_usd = if weight.is_zero() {
            None
        } else {
            Some(borrow_value_usd.try_div(weight)?)
        };

        Ok(LeveragePreview {
            collateral_value_usd,
            position_size_usd,
            borrow_value_usd,
            borrow_amount,
            health_factor,
            liquidation_price_usd,
        })
    }

    /// Deposit collateral and borrow against it in one step
    pub fn open_leveraged_position(
        ledger: &mut PositionLedger<'_>,
        request: &LeverageRequest,
    ) -> Result<(LeveragePreview, HealthFactor)> {
        let preview = Self::preview_leverage(ledger.assets(), ledger.prices(), request)?;

        ledger.apply_deposit(&request.account_id, &request.collateral_asset_id, request.collateral_amount)?;
        ledger.apply_borrow(&request.account_id, &request.borrow_asset_id, preview.borrow_amount)?;

        let health_factor = ledger.health(&request.account_id)?.health_factor;
        Ok((preview, health_factor))
    }

    /// Repay the borrow with accrued interest, then withdraw the collateral.
    /// Fails as a whole when the account's remaining debt cannot do without
    /// that collateral.
    pub fn close_leveraged_position(
        ledger: &mut PositionLedger<'_>,
        request: &CloseLeverageRequest,
    ) -> Result<LeverageUnwind> {
        let CloseLeverageRequest {
            account_id,
            collateral_asset_id,
            borrow_asset_id,
        } = request;

        let book = ledger.account(account_id)?;
        let collateral = book.supplied(collateral_asset_id);
        let debt = book.borrowed(borrow_asset_id);
        if collateral.is_zero() {
            return Err(LendingError::CollateralNotFound {
                account: account_id.clone(),
                asset: collateral_asset_id.clone(),
            });
        }

        if debt > Decimal::ZERO {
            ledger.apply_repay(account_id, borrow_asset_id, debt)?;
        }
        ledger.apply_withdraw(account_id, collateral_asset_id, collateral)?;

        Ok(LeverageUnwind {
            repaid_amount: debt,
            withdrawn_collateral: collateral,
            health_factor: ledger.health(account_id)?.health_factor,
        })
    }
}
