//! Error taxonomy for the lending engine

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AccountId, AssetId, HealthFactor};

/// Errors returned by every engine operation.
///
/// A failed operation never leaves partial state behind.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LendingError {
    #[error("Invalid market state for {asset}: {reason}")]
    InvalidMarketState { asset: AssetId, reason: String },

    #[error("Insufficient supply: requested {requested}, supplied {available}")]
    InsufficientSupply { requested: Decimal, available: Decimal },

    #[error("Insufficient liquidity: requested {requested}, available {available}")]
    InsufficientLiquidity { requested: Decimal, available: Decimal },

    #[error("Withdrawal would leave health factor {health_factor} below {minimum}")]
    WithdrawalUnsafe { health_factor: HealthFactor, minimum: Decimal },

    #[error("Borrow would leave health factor {health_factor} below {minimum}")]
    BorrowUnsafe { health_factor: HealthFactor, minimum: Decimal },

    #[error("Repay amount {requested} exceeds allowed {max}")]
    RepayExceedsDebt { requested: Decimal, max: Decimal },

    #[error("Cannot liquidate healthy account {account} (health factor {health_factor})")]
    PositionHealthy { account: AccountId, health_factor: HealthFactor },

    #[error("Liquidation failed: {0}")]
    LiquidationFailed(String),

    #[error("Price oracle unavailable for {asset}: {reason}")]
    OracleUnavailable { asset: AssetId, reason: String },

    #[error("Amount must be positive, got {0}")]
    InvalidAmount(Decimal),

    #[error("Unknown asset {0}")]
    UnknownAsset(AssetId),

    #[error("Liquidator cannot liquidate their own account")]
    SelfLiquidation,

    #[error("Account {account} has no {asset} collateral")]
    CollateralNotFound { account: AccountId, asset: AssetId },

    #[error("Flash loan not repaid: owed {owed}, returned {repaid}")]
    FlashLoanNotRepaid { owed: Decimal, repaid: Decimal },

    #[error("Leverage {requested}x outside allowed range (1, {max}]")]
    InvalidLeverage { requested: Decimal, max: Decimal },

    #[error("Math operation overflow")]
    MathOverflow,
}

impl LendingError {
    /// Stable machine-readable code
    pub fn error_code(&self) -> &'static str {
        match self {
            LendingError::InvalidMarketState { .. } => "INVALID_MARKET_STATE",
            LendingError::InsufficientSupply { .. } => "INSUFFICIENT_SUPPLY",
            LendingError::InsufficientLiquidity { .. } => "INSUFFICIENT_LIQUIDITY",
            LendingError::WithdrawalUnsafe { .. } => "WITHDRAWAL_UNSAFE",
            LendingError::BorrowUnsafe { .. } => "BORROW_UNSAFE",
            LendingError::RepayExceedsDebt { .. } => "REPAY_EXCEEDS_DEBT",
            LendingError::PositionHealthy { .. } => "POSITION_HEALTHY",
            LendingError::LiquidationFailed(_) => "LIQUIDATION_FAILED",
            LendingError::OracleUnavailable { .. } => "ORACLE_UNAVAILABLE",
            LendingError::InvalidAmount(_) => "INVALID_AMOUNT",
            LendingError::UnknownAsset(_) => "UNKNOWN_ASSET",
            LendingError::SelfLiquidation => "SELF_LIQUIDATION",
            LendingError::CollateralNotFound { .. } => "COLLATERAL_NOT_FOUND",
            LendingError::FlashLoanNotRepaid { .. } => "FLASH_LOAN_NOT_REPAID",
            LendingError::InvalidLeverage { .. } => "INVALID_LEVERAGE",
            LendingError::MathOverflow => "MATH_OVERFLOW",
        }
    }

    /// Whether the caller can adjust the request and resubmit.
    ///
    /// Oracle outages, failed liquidations and arithmetic faults are surfaced
    /// as-is and are not fixed by changing the amount.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            LendingError::LiquidationFailed(_)
                | LendingError::OracleUnavailable { .. }
                | LendingError::InvalidMarketState { .. }
                | LendingError::MathOverflow
        )
    }
}

/// Error shape returned across the function-call boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
}

impl From<&LendingError> for ErrorDetail {
    fn from(err: &LendingError) -> Self {
        Self {
            code: err.error_code().to_string(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LendingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_detail() {
        let err = LendingError::RepayExceedsDebt {
            requested: Decimal::from(6000),
            max: Decimal::from(5000),
        };
        let detail = ErrorDetail::from(&err);

        assert_eq!(detail.code, "REPAY_EXCEEDS_DEBT");
        assert_eq!(detail.message, "Repay amount 6000 exceeds allowed 5000");
        assert!(detail.recoverable);
    }

    #[test]
    fn test_fatal_errors_not_recoverable() {
        assert!(!LendingError::LiquidationFailed("commit".into()).is_recoverable());
        assert!(!LendingError::OracleUnavailable {
            asset: AssetId::from("ETH"),
            reason: "stale".into(),
        }
        .is_recoverable());
    }
}
