//! Staged working set for one action
//!
//! The engine locks the accounts and markets an action touches, copies them
//! into a [`PositionLedger`], and writes the copies back only when the whole
//! action succeeded. Construction accrues interest on every staged market and
//! position, so all balance changes see up-to-date amounts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::{
    error::{LendingError, Result},
    health::{AccountHealth, HealthEngine},
    interest::{InterestRateModel, MarketRates},
    market::{Asset, AssetRegistry, Market},
    math::{TryAdd, TrySub},
    oracle::PriceSnapshot,
    position::AccountBook,
    types::{AccountId, AssetId, HealthFactor},
};

pub struct PositionLedger<'a> {
    assets: &'a AssetRegistry,
    prices: &'a PriceSnapshot,
    now: DateTime<Utc>,
    default_min_health: Decimal,
    accounts: BTreeMap<AccountId, AccountBook>,
    markets: BTreeMap<AssetId, Market>,
    rates: BTreeMap<AssetId, MarketRates>,
}

impl<'a> PositionLedger<'a> {
    /// Stage copies of `accounts` and `markets` and accrue them to `now`.
    ///
    /// Rates come from each market's pre-accrual state. Every asset an
    /// account holds must be among `markets`.
    pub fn stage(
        assets: &'a AssetRegistry,
        prices: &'a PriceSnapshot,
        now: DateTime<Utc>,
        default_min_health: Decimal,
        accounts: impl IntoIterator<Item = AccountBook>,
        markets: impl IntoIterator<Item = Market>,
    ) -> Result<Self> {
        let mut staged_markets = BTreeMap::new();
        let mut rates = BTreeMap::new();

        for mut market in markets {
            let market_rates = InterestRateModel::compute_rates(&market)?;
            market.accrue_interest(&market_rates, now)?;
            rates.insert(market.asset_id.clone(), market_rates);
            staged_markets.insert(market.asset_id.clone(), market);
        }

        let mut staged_accounts = BTreeMap::new();
        for mut book in accounts {
            for position in book.positions.values_mut() {
                let market_rates = rates.get(&position.asset_id).ok_or_else(|| LendingError::InvalidMarketState {
                    asset: position.asset_id.clone(),
                    reason: "market not staged".to_string(),
                })?;
                position.accrue(market_rates, now)?;
            }
            staged_accounts.insert(book.account_id.clone(), book);
        }

        Ok(Self {
            assets,
            prices,
            now,
            default_min_health,
            accounts: staged_accounts,
            markets: staged_markets,
            rates,
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn prices(&self) -> &PriceSnapshot {
        self.prices
    }

    pub fn assets(&self) -> &'a AssetRegistry {
        self.assets
    }

    pub fn asset(&self, id: &AssetId) -> Result<&'a Asset> {
        self.assets.get(id)
    }

    pub fn rates(&self, id: &AssetId) -> MarketRates {
        self.rates.get(id).copied().unwrap_or(MarketRates::ZERO)
    }

    pub fn account(&self, id: &AccountId) -> Result<&AccountBook> {
        self.accounts
            .get(id)
            .ok_or_else(|| LendingError::LiquidationFailed(format!("account {} not staged", id)))
    }

    fn account_mut(&mut self, id: &AccountId) -> Result<&mut AccountBook> {
        self.accounts
            .get_mut(id)
            .ok_or_else(|| LendingError::LiquidationFailed(format!("account {} not staged", id)))
    }

    pub fn market(&self, id: &AssetId) -> Result<&Market> {
        self.markets.get(id).ok_or_else(|| LendingError::UnknownAsset(id.clone()))
    }

    pub(crate) fn market_mut(&mut self, id: &AssetId) -> Result<&mut Market> {
        self.markets.get_mut(id).ok_or_else(|| LendingError::UnknownAsset(id.clone()))
    }

    pub fn health(&self, account: &AccountId) -> Result<AccountHealth> {
        HealthEngine::compute(self.account(account)?, self.assets, self.prices)
    }

    /// Account minimum: engine default raised by the account's strategy
    pub fn min_health_factor(&self, account: &AccountId) -> Result<Decimal> {
        Ok(self
            .account(account)?
            .strategy
            .min_health_factor(self.default_min_health))
    }

    /// Fails with `reject(hf, minimum)` when the account's health factor is below its minimum
    pub fn ensure_min_health<F>(&self, account: &AccountId, reject: F) -> Result<HealthFactor>
    where
        F: FnOnce(HealthFactor, Decimal) -> LendingError,
    {
        let minimum = self.min_health_factor(account)?;
        let health_factor = self.health(account)?.health_factor;
        if health_factor.is_below(minimum) {
            return Err(reject(health_factor, minimum));
        }
        Ok(health_factor)
    }

    fn ensure_positive(amount: Decimal) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(LendingError::InvalidAmount(amount));
        }
        Ok(())
    }

    pub fn apply_deposit(&mut self, account: &AccountId, asset: &AssetId, amount: Decimal) -> Result<()> {
        Self::ensure_positive(amount)?;
        let now = self.now;

        self.market_mut(asset)?.record_supply(amount)?;
        let position = self.account_mut(account)?.position_mut(asset, now);
        position.supplied_amount = position.supplied_amount.try_add(amount)?;

        debug!(account = %account, asset = %asset, amount = %amount, "Deposit staged");
        Ok(())
    }

    pub fn apply_withdraw(&mut self, account: &AccountId, asset: &AssetId, amount: Decimal) -> Result<()> {
        Self::ensure_positive(amount)?;

        let supplied = self.account(account)?.supplied(asset);
        if amount > supplied {
            return Err(LendingError::InsufficientSupply {
                requested: amount,
                available: supplied,
            });
        }

        self.market_mut(asset)?.release_supply(amount)?;
        let now = self.now;
        let book = self.account_mut(account)?;
        book.position_mut(asset, now).supplied_amount -= amount;
        book.prune();

        self.ensure_min_health(account, |health_factor, minimum| LendingError::WithdrawalUnsafe {
            health_factor,
            minimum,
        })?;

        debug!(account = %account, asset = %asset, amount = %amount, "Withdraw staged");
        Ok(())
    }

    pub fn apply_borrow(&mut self, account: &AccountId, asset: &AssetId, amount: Decimal) -> Result<()> {
        Self::ensure_positive(amount)?;

        self.market_mut(asset)?.record_borrow(amount)?;
        let now = self.now;
        let position = self.account_mut(account)?.position_mut(asset, now);
        position.borrowed_amount = position.borrowed_amount.try_add(amount)?;

        self.ensure_min_health(account, |health_factor, minimum| LendingError::BorrowUnsafe {
            health_factor,
            minimum,
        })?;

        debug!(account = %account, asset = %asset, amount = %amount, "Borrow staged");
        Ok(())
    }

    pub fn apply_repay(&mut self, account: &AccountId, asset: &AssetId, amount: Decimal) -> Result<()> {
        Self::ensure_positive(amount)?;

        let borrowed = self.account(account)?.borrowed(asset);
        if amount > borrowed {
            return Err(LendingError::RepayExceedsDebt {
                requested: amount,
                max: borrowed,
            });
        }

        self.market_mut(asset)?.record_repay(amount)?;
        let now = self.now;
        let book = self.account_mut(account)?;
        book.position_mut(asset, now).borrowed_amount -= amount;
        book.prune();

        debug!(account = %account, asset = %asset, amount = %amount, "Repay staged");
        Ok(())
    }

    /// Move supplied balance between accounts without touching market totals
    pub(crate) fn transfer_supply(
        &mut self,
        from: &AccountId,
        to: &AccountId,
        asset: &AssetId,
        amount: Decimal,
    ) -> Result<()> {
        let now = self.now;
        let source = self.account_mut(from)?;
        let available = source.supplied(asset);
        if amount > available {
            return Err(LendingError::InsufficientSupply {
                requested: amount,
                available,
            });
        }
        source.position_mut(asset, now).supplied_amount -= amount;
        source.prune();

        let position = self.account_mut(to)?.position_mut(asset, now);
        position.supplied_amount = position.supplied_amount.try_add(amount)?;
        Ok(())
    }

    /// Burn `amount` of `payer`'s supplied balance to cancel the same amount
    /// of `debtor`'s debt
    pub(crate) fn settle_debt_from_supply(
        &mut self,
        payer: &AccountId,
        debtor: &AccountId,
        asset: &AssetId,
        amount: Decimal,
    ) -> Result<()> {
        let now = self.now;
        let payer_book = self.account_mut(payer)?;
        let available = payer_book.supplied(asset);
        if amount > available {
            return Err(LendingError::InsufficientSupply {
                requested: amount,
                available,
            });
        }
        payer_book.position_mut(asset, now).supplied_amount -= amount;
        payer_book.prune();

        let debtor_book = self.account_mut(debtor)?;
        let borrowed = debtor_book.borrowed(asset);
        if amount > borrowed {
            return Err(LendingError::RepayExceedsDebt {
                requested: amount,
                max: borrowed,
            });
        }
        debtor_book.position_mut(asset, now).borrowed_amount -= amount;
        debtor_book.prune();

        let market = self.market_mut(asset)?;
        market.total_supplied = market.total_supplied.try_sub(amount)?.max(Decimal::ZERO);
        market.record_repay(amount)
    }

    pub fn check_invariants(&self) -> Result<()> {
        self.markets.values().try_for_each(Market::check_invariants)
    }

    /// Hand back the staged records for commit
    pub fn into_parts(self) -> (BTreeMap<AccountId, AccountBook>, BTreeMap<AssetId, Market>) {
        (self.accounts, self.markets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::default_markets, position::StrategyTemplate};

    struct Fixture {
        assets: AssetRegistry,
        prices: PriceSnapshot,
        markets: Vec<Market>,
        now: DateTime<Utc>,
    }

    impl Fixture {
        fn new() -> Self {
            let now = Utc::now();
            let mut assets = AssetRegistry::new();
            let mut markets = Vec::new();
            for config in default_markets() {
                assets.insert(Asset::from_config(&config));
                markets.push(Market::from_config(&config, now));
            }
            let prices = PriceSnapshot::from_prices([
                (AssetId::from("ETH"), Decimal::from(3500)),
                (AssetId::from("USDC"), Decimal::ONE),
                (AssetId::from("DAI"), Decimal::ONE),
                (AssetId::from("BTC"), Decimal::from(65_000)),
            ]);
            Self { assets, prices, markets, now }
        }

        fn ledger(&self, accounts: Vec<AccountBook>) -> PositionLedger<'_> {
            PositionLedger::stage(
                &self.assets,
                &self.prices,
                self.now,
                Decimal::ONE,
                accounts,
                self.markets.clone(),
            )
            .unwrap()
        }
    }

    fn alice() -> AccountId {
        AccountId::from("alice")
    }

    fn eth() -> AssetId {
        AssetId::from("ETH")
    }

    fn usdc() -> AssetId {
        AssetId::from("USDC")
    }

    fn funded(ledger: &mut PositionLedger<'_>) {
        ledger.apply_deposit(&alice(), &eth(), Decimal::from(5)).unwrap();
        ledger
            .apply_deposit(&alice(), &usdc(), Decimal::from(50_000))
            .unwrap();
    }

    #[test]
    fn test_deposit_withdraw_round_trip() {
        let fixture = Fixture::new();
        let mut ledger = fixture.ledger(vec![AccountBook::new(alice())]);
        let amount = Decimal::new(1_234_567_891, 9);

        ledger.apply_deposit(&alice(), &eth(), Decimal::from(2)).unwrap();
        let before = ledger.account(&alice()).unwrap().supplied(&eth());

        ledger.apply_deposit(&alice(), &eth(), amount).unwrap();
        ledger.apply_withdraw(&alice(), &eth(), amount).unwrap();

        assert_eq!(ledger.account(&alice()).unwrap().supplied(&eth()), before);
        assert_eq!(ledger.market(&eth()).unwrap().total_supplied, before);
    }

    #[test]
    fn test_withdraw_more_than_supplied() {
        let fixture = Fixture::new();
        let mut ledger = fixture.ledger(vec![AccountBook::new(alice())]);
        ledger.apply_deposit(&alice(), &eth(), Decimal::ONE).unwrap();

        let err = ledger
            .apply_withdraw(&alice(), &eth(), Decimal::from(2))
            .unwrap_err();
        assert!(matches!(err, LendingError::InsufficientSupply { .. }));
    }

    #[test]
    fn test_borrow_respects_health_and_liquidity() {
        let fixture = Fixture::new();
        let lp = AccountId::from("lp");
        let mut ledger = fixture.ledger(vec![AccountBook::new(alice()), AccountBook::new(lp.clone())]);
        ledger.apply_deposit(&lp, &usdc(), Decimal::from(50_000)).unwrap();
        ledger.apply_deposit(&alice(), &eth(), Decimal::from(5)).unwrap();

        ledger.apply_borrow(&alice(), &usdc(), Decimal::from(10_000)).unwrap();
        let health = ledger.health(&alice()).unwrap();
        assert_eq!(health.health_factor, HealthFactor::Finite(Decimal::new(14, 1)));

        let err = ledger
            .apply_borrow(&alice(), &usdc(), Decimal::from(45_000))
            .unwrap_err();
        assert!(matches!(err, LendingError::InsufficientLiquidity { .. }));

        // 15000 of debt against 14000 of collateral
        let err = ledger
            .apply_borrow(&alice(), &usdc(), Decimal::from(5_000))
            .unwrap_err();
        assert!(matches!(err, LendingError::BorrowUnsafe { .. }));
    }

    #[test]
    fn test_strategy_raises_minimum() {
        let fixture = Fixture::new();
        let mut book = AccountBook::new(alice());
        book.strategy = StrategyTemplate::Conservative;
        let mut ledger = fixture.ledger(vec![book, AccountBook::new(AccountId::from("lp"))]);

        ledger.apply_deposit(&alice(), &eth(), Decimal::from(5)).unwrap();
        ledger
            .apply_deposit(&AccountId::from("lp"), &usdc(), Decimal::from(50_000))
            .unwrap();

        // HF 1.4 is fine at the default minimum but not under Conservative
        let err = ledger
            .apply_borrow(&alice(), &usdc(), Decimal::from(10_000))
            .unwrap_err();
        match err {
            LendingError::BorrowUnsafe { minimum, .. } => assert_eq!(minimum, Decimal::new(15, 1)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_repay_rejects_overpayment() {
        let fixture = Fixture::new();
        let mut ledger = fixture.ledger(vec![AccountBook::new(alice())]);
        funded(&mut ledger);
        ledger.apply_borrow(&alice(), &usdc(), Decimal::from(1_000)).unwrap();

        let err = ledger
            .apply_repay(&alice(), &usdc(), Decimal::from(1_001))
            .unwrap_err();
        assert_eq!(
            err,
            LendingError::RepayExceedsDebt {
                requested: Decimal::from(1_001),
                max: Decimal::from(1_000),
            }
        );

        ledger.apply_repay(&alice(), &usdc(), Decimal::from(1_000)).unwrap();
        assert_eq!(ledger.account(&alice()).unwrap().borrowed(&usdc()), Decimal::ZERO);
        assert_eq!(ledger.market(&usdc()).unwrap().total_borrowed, Decimal::ZERO);
    }

    #[test]
    fn test_non_positive_amount_rejected() {
        let fixture = Fixture::new();
        let mut ledger = fixture.ledger(vec![AccountBook::new(alice())]);
        assert!(matches!(
            ledger.apply_deposit(&alice(), &eth(), Decimal::ZERO),
            Err(LendingError::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.apply_deposit(&alice(), &eth(), Decimal::from(-1)),
            Err(LendingError::InvalidAmount(_))
        ));
    }
}
