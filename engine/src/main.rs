//! Lendstell demo runner
//!
//! Seeds the four default markets, walks an account from deposit through
//! liquidation and prints each result as JSON.

use std::{env, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;

use lendstell_engine::{
    persistence::{JsonFileLedgerStore, LedgerStore},
    telemetry, AccountId, ActionKind, ActionRequest, AssetId, CloseLeverageRequest, EngineConfig, InMemoryPriceOracle,
    LendingEngine, LeverageRequest, LiquidationRequest, SystemClock,
};

fn print_json<T: Serialize>(label: &str, value: &T) -> Result<()> {
    println!("== {label}\n{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let config_path = env::args()
        .nth(1)
        .or_else(|| env::var("LENDSTELL_CONFIG").ok())
        .map(PathBuf::from);
    let config = EngineConfig::load(config_path.as_deref()).context("loading engine configuration")?;

    telemetry::init_tracing(&config.telemetry.log_level);

    let clock = Arc::new(SystemClock);
    let oracle = Arc::new(InMemoryPriceOracle::new(config.oracle.max_price_age, clock.clone()));
    for (asset, price) in [("ETH", 3500), ("USDC", 1), ("DAI", 1), ("BTC", 65_000)] {
        oracle.set_price(asset, Decimal::from(price)).await;
    }

    let engine = LendingEngine::new(config, oracle.clone(), clock)?;

    let lp = AccountId::from("liquidity-provider");
    let borrower = AccountId::from("borrower");
    let liquidator = AccountId::from("liquidator");

    let setup = [
        ActionRequest::new(ActionKind::Deposit, lp.clone(), "USDC", Decimal::from(100_000)),
        ActionRequest::new(ActionKind::Deposit, liquidator.clone(), "USDC", Decimal::from(20_000)),
        ActionRequest::new(ActionKind::Deposit, borrower.clone(), "ETH", Decimal::from(5)),
        ActionRequest::new(ActionKind::Borrow, borrower.clone(), "USDC", Decimal::from(10_000)),
    ];
    for request in setup {
        let receipt = engine.submit_action(request).await?;
        info!(health_factor = %receipt.new_health_factor, "Setup action committed");
    }

    print_json("assets", &engine.get_assets().await?)?;
    print_json("borrower", &engine.get_account_position(&borrower).await?)?;

    info!("ETH drops to $2300");
    oracle.set_price("ETH", Decimal::from(2300)).await;

    let stress = engine
        .stress_test(&borrower, Decimal::from(10), Some(&AssetId::from("ETH")))
        .await?;
    print_json("stress test (-10% ETH)", &stress)?;
    print_json("liquidation candidates", &engine.liquidatable_accounts().await?)?;

    let liquidation = engine
        .submit_liquidation(LiquidationRequest {
            liquidator_id: liquidator.clone(),
            target_account_id: borrower.clone(),
            collateral_asset_id: AssetId::from("ETH"),
            debt_asset_id: AssetId::from("USDC"),
            repay_amount: Decimal::from(5_000),
        })
        .await?;
    print_json("liquidation", &liquidation)?;
    print_json("borrower after liquidation", &engine.get_account_position(&borrower).await?)?;
    print_json("liquidator", &engine.get_account_position(&liquidator).await?)?;
    print_json("market stats", &engine.market_stats().await?)?;

    let trader = AccountId::from("trader");
    let opened = engine
        .open_leveraged_position(LeverageRequest {
            account_id: trader.clone(),
            collateral_asset_id: AssetId::from("ETH"),
            collateral_amount: Decimal::from(2),
            borrow_asset_id: AssetId::from("USDC"),
            leverage: Decimal::new(15, 1),
        })
        .await?;
    print_json("leveraged position", &opened)?;
    let closed = engine
        .close_leveraged_position(CloseLeverageRequest {
            account_id: trader,
            collateral_asset_id: AssetId::from("ETH"),
            borrow_asset_id: AssetId::from("USDC"),
        })
        .await?;
    print_json("leveraged position closed", &closed)?;

    if let Ok(path) = env::var("LENDSTELL_SNAPSHOT_PATH") {
        let store = JsonFileLedgerStore::new(path);
        store.save(&engine.snapshot().await?).await?;
    }

    Ok(())
}
