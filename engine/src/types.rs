//! Shared identifiers and the health factor type

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Asset identifier (market id and asset id are the same key)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(pub String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AssetId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AssetId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Account (wallet) identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AccountId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Ratio of risk-adjusted collateral to debt.
///
/// An account without debt has an unbounded health factor. `Finite` orders
/// below `Unbounded`, so comparisons against thresholds work with `<`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthFactor {
    Finite(Decimal),
    Unbounded,
}

impl HealthFactor {
    /// Liquidation threshold
    pub const LIQUIDATION_THRESHOLD: Decimal = Decimal::ONE;

    pub fn value(&self) -> Option<Decimal> {
        match self {
            HealthFactor::Finite(value) => Some(*value),
            HealthFactor::Unbounded => None,
        }
    }

    pub fn is_below(&self, threshold: Decimal) -> bool {
        match self {
            HealthFactor::Finite(value) => *value < threshold,
            HealthFactor::Unbounded => false,
        }
    }

    /// Eligible for liquidation strictly below 1.0
    pub fn is_liquidatable(&self) -> bool {
        self.is_below(Self::LIQUIDATION_THRESHOLD)
    }
}

impl fmt::Display for HealthFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthFactor::Finite(value) => write!(f, "{}", value.round_dp(4)),
            HealthFactor::Unbounded => write!(f, "inf"),
        }
    }
}
