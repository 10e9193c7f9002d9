#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;

use lendstell_engine::{
    AccountId, ActionKind, ActionReceipt, ActionRequest, EngineConfig, InMemoryPriceOracle, LendingEngine, ManualClock,
    Result,
};

pub struct Harness {
    pub engine: LendingEngine,
    pub oracle: Arc<InMemoryPriceOracle>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let oracle = Arc::new(InMemoryPriceOracle::new(Duration::from_secs(300), clock.clone()));
        for (asset, price) in [("ETH", 3500), ("USDC", 1), ("DAI", 1), ("BTC", 65_000)] {
            oracle.set_price(asset, Decimal::from(price)).await;
        }

        let engine = LendingEngine::new(config, oracle.clone(), clock.clone()).unwrap();
        Self { engine, oracle, clock }
    }

    pub async fn act(&self, kind: ActionKind, account: &str, asset: &str, amount: i64) -> Result<ActionReceipt> {
        self.engine
            .submit_action(ActionRequest::new(kind, account, asset, Decimal::from(amount)))
            .await
    }

    /// LP funds 100k USDC; alice borrows 10k USDC against 5 ETH (HF 1.4)
    pub async fn with_borrower() -> Self {
        let harness = Self::new().await;
        harness.act(ActionKind::Deposit, "lp", "USDC", 100_000).await.unwrap();
        harness.act(ActionKind::Deposit, "alice", "ETH", 5).await.unwrap();
        harness.act(ActionKind::Borrow, "alice", "USDC", 10_000).await.unwrap();
        harness
    }

    pub async fn set_price(&self, asset: &str, price: i64) {
        self.oracle.set_price(asset, Decimal::from(price)).await;
    }
}

pub fn account(id: &str) -> AccountId {
    AccountId::from(id)
}
