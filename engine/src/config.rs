//! Engine configuration with validation
//!
//! Values resolve in order: built-in defaults, an optional TOML file, then
//! `LENDSTELL_*` environment overrides.

use std::{env, fs, path::Path, str::FromStr, time::Duration};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::AssetId;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file error: {0}")]
    FileError(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub risk: RiskParameters,
    pub oracle: OracleConfig,
    pub telemetry: TelemetryConfig,
    pub markets: Vec<MarketConfig>,
}

/// Liquidation and solvency parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskParameters {
    /// Max fraction of a debt position repayable in one liquidation
    pub close_factor: Decimal,
    /// Below this health factor the whole debt may be liquidated
    pub full_liquidation_threshold: Decimal,
    /// Premium paid to liquidators in seized collateral
    pub liquidation_bonus: Decimal,
    /// Floor for post-borrow / post-withdraw health factor
    pub min_health_factor: Decimal,
    pub flash_loan_fee: Decimal,
}

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            close_factor: Decimal::new(5, 1),
            full_liquidation_threshold: Decimal::new(95, 2),
            liquidation_bonus: Decimal::new(5, 2),
            min_health_factor: Decimal::ONE,
            flash_loan_fee: Decimal::new(9, 4),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Prices older than this are treated as unavailable
    #[serde(with = "humantime_serde")]
    pub max_price_age: Duration,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            max_price_age: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Asset listing plus its interest rate curve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    pub id: AssetId,
    pub symbol: String,
    pub name: String,
    pub decimals: u32,
    pub collateral_factor: Decimal,
    pub max_leverage: Decimal,
    pub reserve_factor: Decimal,
    pub base_rate: Decimal,
    pub slope1: Decimal,
    pub slope2: Decimal,
    pub optimal_utilization: Decimal,
}

impl MarketConfig {
    fn listing(id: &str, name: &str, decimals: u32, collateral_factor: Decimal, max_leverage: i64) -> Self {
        Self {
            id: AssetId::from(id),
            symbol: id.to_string(),
            name: name.to_string(),
            decimals,
            collateral_factor,
            max_leverage: Decimal::from(max_leverage),
            reserve_factor: Decimal::new(1, 1),
            base_rate: Decimal::new(2, 2),
            slope1: Decimal::new(1, 1),
            slope2: Decimal::ONE,
            optimal_utilization: Decimal::new(8, 1),
        }
    }
}

/// Default listings: ETH, USDC, DAI, BTC
pub fn default_markets() -> Vec<MarketConfig> {
    vec![
        MarketConfig::listing("ETH", "Ethereum", 18, Decimal::new(8, 1), 5),
        MarketConfig::listing("USDC", "USD Coin", 6, Decimal::new(85, 2), 10),
        MarketConfig::listing("DAI", "Dai", 18, Decimal::new(85, 2), 10),
        MarketConfig::listing("BTC", "Bitcoin", 8, Decimal::new(75, 2), 3),
    ]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            risk: RiskParameters::default(),
            oracle: OracleConfig::default(),
            telemetry: TelemetryConfig::default(),
            markets: default_markets(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::FileError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Apply `LENDSTELL_*` overrides using `lookup` to read variables
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let decimal_overrides: [(&str, &mut Decimal); 5] = [
            ("LENDSTELL_CLOSE_FACTOR", &mut self.risk.close_factor),
            ("LENDSTELL_FULL_LIQUIDATION_THRESHOLD", &mut self.risk.full_liquidation_threshold),
            ("LENDSTELL_LIQUIDATION_BONUS", &mut self.risk.liquidation_bonus),
            ("LENDSTELL_MIN_HEALTH_FACTOR", &mut self.risk.min_health_factor),
            ("LENDSTELL_FLASH_LOAN_FEE", &mut self.risk.flash_loan_fee),
        ];

        for (key, slot) in decimal_overrides {
            if let Some(raw) = lookup(key) {
                *slot = Decimal::from_str(raw.trim()).map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw.clone(),
                })?;
            }
        }

        if let Some(raw) = lookup("LENDSTELL_MAX_PRICE_AGE_SECS") {
            let secs: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "LENDSTELL_MAX_PRICE_AGE_SECS".to_string(),
                value: raw.clone(),
            })?;
            self.oracle.max_price_age = Duration::from_secs(secs);
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            self.telemetry.log_level = level;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let risk = &self.risk;
        let unit = |value: Decimal| value > Decimal::ZERO && value <= Decimal::ONE;

        if !unit(risk.close_factor) {
            return Err(ConfigError::InvalidConfig("close_factor must be in (0, 1]".to_string()));
        }
        if !unit(risk.full_liquidation_threshold) {
            return Err(ConfigError::InvalidConfig(
                "full_liquidation_threshold must be in (0, 1]".to_string(),
            ));
        }
        if risk.liquidation_bonus < Decimal::ZERO || risk.liquidation_bonus >= Decimal::ONE {
            return Err(ConfigError::InvalidConfig("liquidation_bonus must be in [0, 1)".to_string()));
        }
        if risk.min_health_factor < Decimal::ONE {
            return Err(ConfigError::InvalidConfig("min_health_factor must be >= 1.0".to_string()));
        }
        if risk.flash_loan_fee < Decimal::ZERO || risk.flash_loan_fee >= Decimal::ONE {
            return Err(ConfigError::InvalidConfig("flash_loan_fee must be in [0, 1)".to_string()));
        }

        if self.markets.is_empty() {
            return Err(ConfigError::InvalidConfig("at least one market is required".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for market in &self.markets {
            if !seen.insert(&market.id) {
                return Err(ConfigError::InvalidConfig(format!("duplicate market {}", market.id)));
            }
            if market.collateral_factor < Decimal::ZERO || market.collateral_factor >= Decimal::ONE {
                return Err(ConfigError::InvalidConfig(format!(
                    "{}: collateral_factor must be in [0, 1)",
                    market.id
                )));
            }
            if market.reserve_factor < Decimal::ZERO || market.reserve_factor > Decimal::ONE {
                return Err(ConfigError::InvalidConfig(format!(
                    "{}: reserve_factor must be in [0, 1]",
                    market.id
                )));
            }
            if market.optimal_utilization <= Decimal::ZERO || market.optimal_utilization >= Decimal::ONE {
                return Err(ConfigError::InvalidConfig(format!(
                    "{}: optimal_utilization must be in (0, 1)",
                    market.id
                )));
            }
            if market.base_rate < Decimal::ZERO || market.slope1 < Decimal::ZERO || market.slope2 < Decimal::ZERO {
                return Err(ConfigError::InvalidConfig(format!("{}: negative rate parameter", market.id)));
            }
            if market.max_leverage < Decimal::ONE {
                return Err(ConfigError::InvalidConfig(format!("{}: max_leverage must be >= 1", market.id)));
            }
            if market.decimals > 28 {
                return Err(ConfigError::InvalidConfig(format!("{}: decimals must be <= 28", market.id)));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.markets.len(), 4);
        assert_eq!(config.risk.close_factor, Decimal::new(5, 1));
    }

    #[test]
    fn test_toml_partial_override() {
        let config = EngineConfig::from_toml_str(
            r#"
            [risk]
            close_factor = "0.4"
            liquidation_bonus = "0.08"

            [oracle]
            max_price_age = "30s"
            "#,
        )
        .unwrap();

        assert_eq!(config.risk.close_factor, Decimal::new(4, 1));
        assert_eq!(config.risk.liquidation_bonus, Decimal::new(8, 2));
        assert_eq!(config.risk.min_health_factor, Decimal::ONE);
        assert_eq!(config.oracle.max_price_age, Duration::from_secs(30));
        assert_eq!(config.markets.len(), 4);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [[markets]]
            id = "WETH"
            symbol = "WETH"
            name = "Wrapped Ether"
            decimals = 18
            collateral_factor = "0.8"
            max_leverage = "4"
            reserve_factor = "0.1"
            base_rate = "0.01"
            slope1 = "0.04"
            slope2 = "0.75"
            optimal_utilization = "0.8"
            "#
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.markets.len(), 1);
        assert_eq!(config.markets[0].id, AssetId::from("WETH"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("LENDSTELL_CLOSE_FACTOR", "0.25"),
            ("LENDSTELL_MAX_PRICE_AGE_SECS", "60"),
            ("LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.risk.close_factor, Decimal::new(25, 2));
        assert_eq!(config.oracle.max_price_age, Duration::from_secs(60));
        assert_eq!(config.telemetry.log_level, "debug");
    }

    #[test]
    fn test_invalid_override_rejected() {
        let mut config = EngineConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "LENDSTELL_LIQUIDATION_BONUS").then(|| "five percent".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_validation_rejects_bad_curve() {
        let mut config = EngineConfig::default();
        config.markets[0].optimal_utilization = Decimal::ONE;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.markets.push(config.markets[0].clone());
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.risk.min_health_factor = Decimal::new(9, 1);
        assert!(config.validate().is_err());
    }
}
