//! Lendstell collateralized lending engine
//!
//! Tracks supplied and borrowed balances per account and asset, accrues
//! interest from a kinked utilization curve, values accounts against an
//! external price oracle and processes liquidations of accounts whose health
//! factor falls below 1.

pub mod analytics;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod interest;
pub mod ledger;
pub mod market;
pub mod math;
pub mod oracle;
pub mod persistence;
pub mod position;
pub mod processor;
pub mod telemetry;
pub mod types;

pub use analytics::{LiquidationCandidate, MarketStats, RiskLevel, StressTestResult};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig, MarketConfig, RiskParameters};
pub use engine::{
    AccountPositionView, AssetBalance, AssetView, BalanceSummary, ClosedPositionReceipt, LendingEngine,
    LeveragedPositionReceipt,
};
pub use error::{ErrorDetail, LendingError, Result};
pub use health::{AccountHealth, HealthEngine};
pub use interest::{InterestRateModel, MarketRates};
pub use market::{Asset, Market};
pub use oracle::{InMemoryPriceOracle, PriceOracle, PriceSnapshot};
pub use persistence::{InMemoryLedgerStore, JsonFileLedgerStore, LedgerSnapshot, LedgerStore, PersistenceError};
pub use position::{AccountBook, Position, StrategyTemplate};
pub use processor::{
    ActionKind, ActionReceipt, ActionRequest, CloseLeverageRequest, FlashLoanReceipt, FlashLoanReceiver, LeveragePreview,
    LeverageRequest, LeverageUnwind, LiquidationRequest, LiquidationResult,
};
pub use types::{AccountId, AssetId, HealthFactor};
