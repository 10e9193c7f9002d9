//! Lending engine: the function-call boundary
//!
//! Accounts and markets each sit behind their own `tokio::sync::Mutex`. An
//! action locks every account it touches in ascending id order, then every
//! market those accounts hold or the action names, again in ascending id
//! order. Work is staged on copies and written back only on success.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    config::{ConfigError, EngineConfig},
    error::{LendingError, Result},
    interest::InterestRateModel,
    ledger::PositionLedger,
    market::{Asset, AssetRegistry, Market},
    math::{TryAdd, TryMul},
    oracle::PriceOracle,
    persistence::LedgerSnapshot,
    position::{AccountBook, StrategyTemplate},
    processor::{
        ActionProcessor, ActionReceipt, ActionRequest, CloseLeverageRequest, FlashLoanReceipt, FlashLoanReceiver,
        LeveragePreview, LeverageRequest, LeverageUnwind, LiquidationRequest, LiquidationResult,
    },
    types::{AccountId, AssetId, HealthFactor},
};

/// Market listing with live rates and price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetView {
    pub id: AssetId,
    pub symbol: String,
    pub name: String,
    pub price_usd: Decimal,
    pub supply_apy: Decimal,
    pub borrow_apy: Decimal,
    pub total_supplied: Decimal,
    pub total_borrowed: Decimal,
    pub utilization_rate: Decimal,
    /// Unborrowed liquidity
    pub available: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset_id: AssetId,
    pub symbol: String,
    pub amount: Decimal,
    pub price_usd: Decimal,
    pub value_usd: Decimal,
    /// Supply APY for collateral, borrow APY for debt
    pub apy: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceSummary {
    pub total_value_usd: Decimal,
    pub assets: Vec<AssetBalance>,
}

impl BalanceSummary {
    fn push(&mut self, balance: AssetBalance) -> Result<()> {
        self.total_value_usd = self.total_value_usd.try_add(balance.value_usd)?;
        self.assets.push(balance);
        Ok(())
    }
}

/// Account balances at market value, with interest accrued to now
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountPositionView {
    pub account_id: AccountId,
    pub collateral: BalanceSummary,
    pub borrowed: BalanceSummary,
    pub health_factor: HealthFactor,
    pub min_health_factor: Decimal,
    pub strategy: StrategyTemplate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeveragedPositionReceipt {
    pub preview: LeveragePreview,
    pub receipt: ActionReceipt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedPositionReceipt {
    pub unwind: LeverageUnwind,
    pub receipt: ActionReceipt,
}

type AccountHandle = Arc<Mutex<AccountBook>>;

/// A locked account together with the map entry it was locked through
struct LockedAccount {
    handle: AccountHandle,
    guard: OwnedMutexGuard<AccountBook>,
}

struct LockedSet {
    accounts: Vec<LockedAccount>,
    markets: Vec<OwnedMutexGuard<Market>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Commit,
    ReadOnly,
}

pub struct LendingEngine {
    config: EngineConfig,
    assets: AssetRegistry,
    markets: HashMap<AssetId, Arc<Mutex<Market>>>,
    accounts: DashMap<AccountId, AccountHandle>,
    oracle: Arc<dyn PriceOracle>,
    clock: Arc<dyn Clock>,
}

impl LendingEngine {
    pub fn new(
        config: EngineConfig,
        oracle: Arc<dyn PriceOracle>,
        clock: Arc<dyn Clock>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let now = clock.now();
        let mut assets = AssetRegistry::new();
        let mut markets = HashMap::new();
        for market_config in &config.markets {
            assets.insert(Asset::from_config(market_config));
            markets.insert(
                market_config.id.clone(),
                Arc::new(Mutex::new(Market::from_config(market_config, now))),
            );
        }

        info!(markets = markets.len(), "Lending engine initialized");

        Ok(Self {
            config,
            assets,
            markets,
            accounts: DashMap::new(),
            oracle,
            clock,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn asset_registry(&self) -> &AssetRegistry {
        &self.assets
    }

    /// Current market aggregate, without accrual
    pub async fn market(&self, asset: &AssetId) -> Result<Market> {
        let handle = self.markets.get(asset).ok_or_else(|| LendingError::UnknownAsset(asset.clone()))?;
        let market = handle.lock().await.clone();
        Ok(market)
    }

    pub(crate) fn account_ids(&self) -> BTreeSet<AccountId> {
        self.accounts.iter().map(|entry| entry.key().clone()).collect()
    }

    pub(crate) fn has_account(&self, id: &AccountId) -> bool {
        self.accounts.contains_key(id)
    }

    pub(crate) fn market_ids(&self) -> Vec<AssetId> {
        self.assets.ids().cloned().collect()
    }

    fn account_handle(&self, id: &AccountId) -> AccountHandle {
        self.accounts
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(AccountBook::new(id.clone()))))
            .clone()
    }

    /// Lock the live handle for `id`. A handle pruned from the map while
    /// this task waited on it is stale, so the lookup starts over.
    async fn lock_account(&self, id: &AccountId) -> LockedAccount {
        loop {
            let handle = self.account_handle(id);
            let guard = handle.clone().lock_owned().await;
            let live = self
                .accounts
                .get(id)
                .map(|entry| Arc::ptr_eq(entry.value(), &handle))
                .unwrap_or(false);
            if live {
                return LockedAccount { handle, guard };
            }
            debug!(account = %id, "Account handle pruned while waiting, retrying");
        }
    }

    async fn lock(&self, accounts: &[&AccountId], assets: &[&AssetId]) -> Result<LockedSet> {
        for asset in assets {
            self.assets.get(asset)?;
        }

        let account_ids: BTreeSet<&AccountId> = accounts.iter().copied().collect();
        let mut locked_accounts = Vec::with_capacity(account_ids.len());
        for id in account_ids {
            locked_accounts.push(self.lock_account(id).await);
        }

        let mut asset_ids: BTreeSet<AssetId> = assets.iter().map(|asset| (*asset).clone()).collect();
        for account in &locked_accounts {
            asset_ids.extend(account.guard.asset_ids().cloned());
        }

        let mut market_guards = Vec::with_capacity(asset_ids.len());
        for id in &asset_ids {
            let handle = self
                .markets
                .get(id)
                .ok_or_else(|| LendingError::UnknownAsset(id.clone()))?
                .clone();
            market_guards.push(handle.lock_owned().await);
        }

        Ok(LockedSet {
            accounts: locked_accounts,
            markets: market_guards,
        })
    }

    /// Remove map entries for locked accounts that hold nothing. Runs before
    /// the guards are released, so a task queued on a removed handle sees it
    /// is stale instead of committing into it.
    fn prune_empty(&self, locked: &LockedSet) {
        for account in &locked.accounts {
            let book = &*account.guard;
            if book.is_empty() && book.strategy == StrategyTemplate::Standard {
                self.accounts
                    .remove_if(&book.account_id, |_, handle| Arc::ptr_eq(handle, &account.handle));
            }
        }
    }

    /// Lock, snapshot prices, stage and accrue, run `op`, and commit in
    /// `Mode::Commit` when `op` succeeds
    pub(crate) async fn execute<T, F>(
        &self,
        accounts: &[&AccountId],
        assets: &[&AssetId],
        mode: Mode,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut PositionLedger<'_>) -> Result<T>,
    {
        let mut locked = self.lock(accounts, assets).await?;
        let result = self.stage_and_run(&mut locked, mode, op).await;
        self.prune_empty(&locked);
        result
    }

    async fn stage_and_run<T, F>(&self, locked: &mut LockedSet, mode: Mode, op: F) -> Result<T>
    where
        F: FnOnce(&mut PositionLedger<'_>) -> Result<T>,
    {
        let asset_ids: Vec<AssetId> = locked.markets.iter().map(|market| market.asset_id.clone()).collect();
        let prices = self.oracle.snapshot(&asset_ids).await?;
        let now = self.clock.now();

        let mut ledger = PositionLedger::stage(
            &self.assets,
            &prices,
            now,
            self.config.risk.min_health_factor,
            locked.accounts.iter().map(|account| (*account.guard).clone()),
            locked.markets.iter().map(|guard| (**guard).clone()),
        )?;

        let output = op(&mut ledger)?;

        if mode == Mode::Commit {
            ledger.check_invariants()?;
            let (mut books, mut markets) = ledger.into_parts();
            for account in locked.accounts.iter_mut() {
                if let Some(book) = books.remove(&account.guard.account_id) {
                    *account.guard = book;
                }
            }
            for guard in locked.markets.iter_mut() {
                if let Some(market) = markets.remove(&guard.asset_id) {
                    **guard = market;
                }
            }
        }

        Ok(output)
    }

    /// All listed markets with prices and current rates
    pub async fn get_assets(&self) -> Result<Vec<AssetView>> {
        let ids = self.market_ids();
        let refs: Vec<&AssetId> = ids.iter().collect();

        self.execute(&[], &refs, Mode::ReadOnly, |ledger| {
            ids.iter()
                .map(|id| -> Result<AssetView> {
                    let asset = ledger.asset(id)?;
                    let market = ledger.market(id)?;
                    let rates = InterestRateModel::compute_rates(market)?;
                    Ok(AssetView {
                        id: id.clone(),
                        symbol: asset.symbol.clone(),
                        name: asset.name.clone(),
                        price_usd: ledger.prices().price(id)?,
                        supply_apy: rates.supply_apy,
                        borrow_apy: rates.borrow_apy,
                        total_supplied: market.total_supplied,
                        total_borrowed: market.total_borrowed,
                        utilization_rate: rates.utilization,
                        available: market.available_liquidity(),
                    })
                })
                .collect()
        })
        .await
    }

    pub async fn get_account_position(&self, account: &AccountId) -> Result<AccountPositionView> {
        if !self.has_account(account) {
            return Ok(AccountPositionView {
                account_id: account.clone(),
                collateral: BalanceSummary::default(),
                borrowed: BalanceSummary::default(),
                health_factor: HealthFactor::Unbounded,
                min_health_factor: StrategyTemplate::Standard.min_health_factor(self.config.risk.min_health_factor),
                strategy: StrategyTemplate::Standard,
            });
        }

        self.execute(&[account], &[], Mode::ReadOnly, |ledger| {
            let book = ledger.account(account)?;
            let mut collateral = BalanceSummary::default();
            let mut borrowed = BalanceSummary::default();

            for position in book.positions.values() {
                let asset = ledger.asset(&position.asset_id)?;
                let price_usd = ledger.prices().price(&position.asset_id)?;
                let rates = InterestRateModel::compute_rates(ledger.market(&position.asset_id)?)?;
                let balance = |amount: Decimal, apy: Decimal| -> Result<AssetBalance> {
                    Ok(AssetBalance {
                        asset_id: asset.id.clone(),
                        symbol: asset.symbol.clone(),
                        amount,
                        price_usd,
                        value_usd: amount.try_mul(price_usd)?,
                        apy,
                    })
                };

                if position.supplied_amount > Decimal::ZERO {
                    collateral.push(balance(position.supplied_amount, rates.supply_apy)?)?;
                }
                if position.borrowed_amount > Decimal::ZERO {
                    borrowed.push(balance(position.borrowed_amount, rates.borrow_apy)?)?;
                }
            }

            Ok(AccountPositionView {
                account_id: account.clone(),
                collateral,
                borrowed,
                health_factor: ledger.health(account)?.health_factor,
                min_health_factor: ledger.min_health_factor(account)?,
                strategy: book.strategy,
            })
        })
        .await
    }

    pub async fn submit_action(&self, request: ActionRequest) -> Result<ActionReceipt> {
        let result = self
            .execute(&[&request.account_id], &[&request.asset_id], Mode::Commit, |ledger| {
                let health_factor = ActionProcessor::apply(ledger, &request)?;
                Ok(ActionReceipt::committed(health_factor, ledger.now()))
            })
            .await;

        match &result {
            Ok(receipt) => info!(
                action = ?request.kind,
                account = %request.account_id,
                asset = %request.asset_id,
                amount = %request.amount,
                health_factor = %receipt.new_health_factor,
                action_id = %receipt.action_id,
                "Action committed"
            ),
            Err(err) => debug!(
                action = ?request.kind,
                account = %request.account_id,
                asset = %request.asset_id,
                error = %err,
                "Action rejected"
            ),
        }

        result
    }

    pub async fn submit_liquidation(&self, request: LiquidationRequest) -> Result<LiquidationResult> {
        if request.liquidator_id == request.target_account_id {
            return Err(LendingError::SelfLiquidation);
        }

        let risk = self.config.risk.clone();
        let result = self
            .execute(
                &[&request.liquidator_id, &request.target_account_id],
                &[&request.collateral_asset_id, &request.debt_asset_id],
                Mode::Commit,
                |ledger| {
                    let result = ActionProcessor::liquidate(ledger, &risk, &request)?;
                    ledger
                        .check_invariants()
                        .map_err(|err| LendingError::LiquidationFailed(err.to_string()))?;
                    Ok(result)
                },
            )
            .await;

        match &result {
            Ok(liquidation) => info!(
                liquidation_id = %liquidation.liquidation_id,
                liquidator = %liquidation.liquidator_id,
                account = %liquidation.target_account_id,
                repaid = %liquidation.repaid_amount,
                seized = %liquidation.seized_collateral,
                "Liquidation committed"
            ),
            Err(err) => warn!(
                liquidator = %request.liquidator_id,
                account = %request.target_account_id,
                error = %err,
                "Liquidation rejected"
            ),
        }

        result
    }

    /// Lend pool cash to `receiver`; nothing changes unless it repays
    /// principal plus fee
    pub async fn flash_loan<R>(
        &self,
        account: &AccountId,
        asset: &AssetId,
        amount: Decimal,
        receiver: &mut R,
    ) -> Result<FlashLoanReceipt>
    where
        R: FlashLoanReceiver + ?Sized,
    {
        let fee_rate = self.config.risk.flash_loan_fee;
        let receipt = self
            .execute(&[], &[asset], Mode::Commit, |ledger| {
                ActionProcessor::flash_loan(ledger, fee_rate, account, asset, amount, receiver)
            })
            .await?;

        info!(
            account = %account,
            asset = %asset,
            amount = %amount,
            fee = %receipt.fee,
            "Flash loan settled"
        );
        Ok(receipt)
    }

    pub async fn preview_leverage(&self, request: &LeverageRequest) -> Result<LeveragePreview> {
        let assets = [
            request.collateral_asset_id.clone(),
            request.borrow_asset_id.clone(),
        ];
        for asset in &assets {
            self.assets.get(asset)?;
        }
        let prices = self.oracle.snapshot(&assets).await?;
        ActionProcessor::preview_leverage(&self.assets, &prices, request)
    }

    pub async fn open_leveraged_position(&self, request: LeverageRequest) -> Result<LeveragedPositionReceipt> {
        let receipt = self
            .execute(
                &[&request.account_id],
                &[&request.collateral_asset_id, &request.borrow_asset_id],
                Mode::Commit,
                |ledger| {
                    let (preview, health_factor) = ActionProcessor::open_leveraged_position(ledger, &request)?;
                    Ok(LeveragedPositionReceipt {
                        preview,
                        receipt: ActionReceipt::committed(health_factor, ledger.now()),
                    })
                },
            )
            .await?;

        info!(
            account = %request.account_id,
            collateral = %request.collateral_asset_id,
            borrow = %request.borrow_asset_id,
            leverage = %request.leverage,
            health_factor = %receipt.receipt.new_health_factor,
            "Leveraged position opened"
        );
        Ok(receipt)
    }

    /// Repay the borrow leg and withdraw all collateral in one commit
    pub async fn close_leveraged_position(&self, request: CloseLeverageRequest) -> Result<ClosedPositionReceipt> {
        let receipt = self
            .execute(
                &[&request.account_id],
                &[&request.collateral_asset_id, &request.borrow_asset_id],
                Mode::Commit,
                |ledger| {
                    let unwind = ActionProcessor::close_leveraged_position(ledger, &request)?;
                    let receipt = ActionReceipt::committed(unwind.health_factor, ledger.now());
                    Ok(ClosedPositionReceipt { unwind, receipt })
                },
            )
            .await?;

        info!(
            account = %request.account_id,
            collateral = %request.collateral_asset_id,
            borrow = %request.borrow_asset_id,
            repaid = %receipt.unwind.repaid_amount,
            withdrawn = %receipt.unwind.withdrawn_collateral,
            "Leveraged position closed"
        );
        Ok(receipt)
    }

    pub async fn set_strategy(&self, account: &AccountId, strategy: StrategyTemplate) -> Result<()> {
        if let StrategyTemplate::Custom(value) = strategy {
            if value <= Decimal::ZERO {
                return Err(LendingError::InvalidAmount(value));
            }
        }

        let mut locked_account = self.lock_account(account).await;
        locked_account.guard.strategy = strategy;
        self.prune_empty(&LockedSet {
            accounts: vec![locked_account],
            markets: Vec::new(),
        });

        info!(account = %account, strategy = ?strategy, "Strategy updated");
        Ok(())
    }

    /// Consistent copy of every market and non-empty account
    pub async fn snapshot(&self) -> Result<LedgerSnapshot> {
        let account_ids = self.account_ids();
        let account_refs: Vec<&AccountId> = account_ids.iter().collect();
        let market_ids = self.market_ids();
        let market_refs: Vec<&AssetId> = market_ids.iter().collect();

        let locked = self.lock(&account_refs, &market_refs).await?;
        let snapshot = LedgerSnapshot::new(
            self.clock.now(),
            locked.markets.iter().map(|guard| (**guard).clone()).collect(),
            locked
                .accounts
                .iter()
                .map(|account| &*account.guard)
                .filter(|book| !book.is_empty() || book.strategy != StrategyTemplate::Standard)
                .cloned()
                .collect(),
        );
        self.prune_empty(&locked);

        Ok(snapshot)
    }

    /// Replace all ledger state with `snapshot`
    pub async fn restore(&self, snapshot: LedgerSnapshot) -> Result<()> {
        for market in &snapshot.markets {
            self.assets.get(&market.asset_id)?;
            market.check_invariants()?;
        }
        for book in &snapshot.accounts {
            for asset in book.asset_ids() {
                self.assets.get(asset)?;
            }
        }

        let restored: HashSet<AccountId> = snapshot.accounts.iter().map(|book| book.account_id.clone()).collect();
        let mut account_ids = self.account_ids();
        account_ids.extend(restored.iter().cloned());
        let account_refs: Vec<&AccountId> = account_ids.iter().collect();
        let market_ids = self.market_ids();
        let market_refs: Vec<&AssetId> = market_ids.iter().collect();

        let mut locked = self.lock(&account_refs, &market_refs).await?;

        let mut books: HashMap<AccountId, AccountBook> = snapshot
            .accounts
            .into_iter()
            .map(|book| (book.account_id.clone(), book))
            .collect();
        for account in locked.accounts.iter_mut() {
            let id = account.guard.account_id.clone();
            *account.guard = books.remove(&id).unwrap_or_else(|| AccountBook::new(id));
        }

        let mut markets: HashMap<AssetId, Market> = snapshot
            .markets
            .into_iter()
            .map(|market| (market.asset_id.clone(), market))
            .collect();
        for guard in locked.markets.iter_mut() {
            if let Some(market) = markets.remove(&guard.asset_id) {
                **guard = market;
            }
        }

        // Accounts absent from the snapshot are empty now and leave the map
        // while still locked
        self.prune_empty(&locked);
        drop(locked);

        info!(
            accounts = restored.len(),
            taken_at = %snapshot.taken_at,
            "Ledger restored from snapshot"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::{
        clock::ManualClock,
        oracle::InMemoryPriceOracle,
        processor::ActionKind,
    };

    async fn engine() -> LendingEngine {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let oracle = Arc::new(InMemoryPriceOracle::new(Duration::from_secs(300), clock.clone()));
        for (asset, price) in [("ETH", 3500), ("USDC", 1), ("DAI", 1), ("BTC", 65_000)] {
            oracle.set_price(asset, Decimal::from(price)).await;
        }
        LendingEngine::new(EngineConfig::default(), oracle, clock).unwrap()
    }

    fn request(kind: ActionKind, account: &str, asset: &str, amount: i64) -> ActionRequest {
        ActionRequest::new(kind, account, asset, Decimal::from(amount))
    }

    #[tokio::test]
    async fn test_deposit_queued_behind_restore_is_kept() {
        let engine = engine().await;
        let stranger = AccountId::from("stranger");
        let dai = AssetId::from("DAI");

        let snapshot = engine.snapshot().await.unwrap();
        engine
            .submit_action(request(ActionKind::Deposit, "stranger", "DAI", 50))
            .await
            .unwrap();

        // Queue restore and then a deposit on the same account
        let held = engine.account_handle(&stranger).lock_owned().await;
        let (restored, deposited, _) = tokio::join!(
            engine.restore(snapshot),
            engine.submit_action(request(ActionKind::Deposit, "stranger", "DAI", 1000)),
            async {
                tokio::task::yield_now().await;
                drop(held);
            }
        );
        restored.unwrap();
        deposited.unwrap();

        let view = engine.get_account_position(&stranger).await.unwrap();
        assert_eq!(view.collateral.assets.len(), 1);
        assert_eq!(view.collateral.assets[0].amount, Decimal::from(1000));
        assert_eq!(engine.market(&dai).await.unwrap().total_supplied, Decimal::from(1000));
    }

    #[tokio::test]
    async fn test_rejected_requests_leave_no_accounts_behind() {
        let engine = engine().await;
        engine
            .submit_action(request(ActionKind::Deposit, "lp", "USDC", 100_000))
            .await
            .unwrap();
        engine
            .submit_action(request(ActionKind::Deposit, "alice", "ETH", 5))
            .await
            .unwrap();
        engine
            .submit_action(request(ActionKind::Borrow, "alice", "USDC", 10_000))
            .await
            .unwrap();

        assert!(engine
            .submit_action(request(ActionKind::Repay, "ghost", "USDC", 10))
            .await
            .is_err());
        assert!(!engine.has_account(&AccountId::from("ghost")));

        let liquidation = LiquidationRequest {
            liquidator_id: AccountId::from("bogus"),
            target_account_id: AccountId::from("alice"),
            collateral_asset_id: AssetId::from("ETH"),
            debt_asset_id: AssetId::from("USDC"),
            repay_amount: Decimal::from(1000),
        };
        assert!(matches!(
            engine.submit_liquidation(liquidation).await,
            Err(LendingError::PositionHealthy { .. })
        ));
        assert!(!engine.has_account(&AccountId::from("bogus")));
        assert!(engine.has_account(&AccountId::from("alice")));

        engine
            .submit_action(request(ActionKind::Deposit, "dave", "DAI", 10))
            .await
            .unwrap();
        engine
            .submit_action(request(ActionKind::Withdraw, "dave", "DAI", 10))
            .await
            .unwrap();
        assert!(!engine.has_account(&AccountId::from("dave")));
    }
}
