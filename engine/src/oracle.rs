//! Price oracle boundary
//!
//! Every action reads prices once through [`PriceOracle::snapshot`] and uses
//! that snapshot for its whole duration. Missing, non-positive or stale
//! prices surface as `OracleUnavailable`; there is no fallback price.

use std::{collections::BTreeMap, collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{
    clock::Clock,
    error::{LendingError, Result},
    types::AssetId,
};

/// USD prices for a set of assets, fixed for the duration of one action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    prices: BTreeMap<AssetId, Decimal>,
}

impl PriceSnapshot {
    pub fn from_prices(prices: impl IntoIterator<Item = (AssetId, Decimal)>) -> Self {
        Self {
            prices: prices.into_iter().collect(),
        }
    }

    pub fn price(&self, asset: &AssetId) -> Result<Decimal> {
        self.prices
            .get(asset)
            .copied()
            .ok_or_else(|| LendingError::OracleUnavailable {
                asset: asset.clone(),
                reason: "price missing from snapshot".to_string(),
            })
    }

    /// Copy with one price scaled by `factor`
    pub fn with_scaled(&self, asset: &AssetId, factor: Decimal) -> Self {
        let mut next = self.clone();
        if let Some(price) = next.prices.get_mut(asset) {
            *price *= factor;
        }
        next
    }

    pub fn with_scaled_all(&self, factor: Decimal) -> Self {
        Self {
            prices: self.prices.iter().map(|(k, v)| (k.clone(), *v * factor)).collect(),
        }
    }
}

/// Source of current USD prices
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Current USD price of `asset`
    async fn price_usd(&self, asset: &AssetId) -> Result<Decimal>;

    /// Read every asset in `assets`; fails on the first unavailable price
    async fn snapshot(&self, assets: &[AssetId]) -> Result<PriceSnapshot> {
        let prices = try_join_all(assets.iter().map(|asset| async move {
            self.price_usd(asset).await.map(|price| (asset.clone(), price))
        }))
        .await?;

        Ok(PriceSnapshot::from_prices(prices))
    }
}

#[derive(Debug, Clone, Copy)]
struct PricePoint {
    price: Decimal,
    updated_at: DateTime<Utc>,
}

/// Oracle fed by explicit ticks, with staleness detection
pub struct InMemoryPriceOracle {
    prices: RwLock<HashMap<AssetId, PricePoint>>,
    max_age: Duration,
    clock: Arc<dyn Clock>,
}

impl InMemoryPriceOracle {
    pub fn new(max_age: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
            max_age,
            clock,
        }
    }

    /// Record a price tick stamped with the current clock time
    pub async fn set_price(&self, asset: impl Into<AssetId>, price: Decimal) {
        let now = self.clock.now();
        self.set_price_at(asset, price, now).await;
    }

    pub async fn set_price_at(&self, asset: impl Into<AssetId>, price: Decimal, updated_at: DateTime<Utc>) {
        let asset = asset.into();
        debug!(asset = %asset, price = %price, "Price tick");
        self.prices
            .write()
            .await
            .insert(asset, PricePoint { price, updated_at });
    }
}

#[async_trait]
impl PriceOracle for InMemoryPriceOracle {
    async fn price_usd(&self, asset: &AssetId) -> Result<Decimal> {
        let point = self.prices.read().await.get(asset).copied().ok_or_else(|| {
            LendingError::OracleUnavailable {
                asset: asset.clone(),
                reason: "no price published".to_string(),
            }
        })?;

        if point.price <= Decimal::ZERO {
            return Err(LendingError::OracleUnavailable {
                asset: asset.clone(),
                reason: format!("invalid price {}", point.price),
            });
        }

        // A tick stamped in the future counts as fresh
        let age = (self.clock.now() - point.updated_at).to_std().unwrap_or_default();
        if age > self.max_age {
            warn!(
                asset = %asset,
                age_secs = age.as_secs(),
                max_age_secs = self.max_age.as_secs(),
                "Rejecting stale price"
            );
            return Err(LendingError::OracleUnavailable {
                asset: asset.clone(),
                reason: format!("price is {}s old", age.as_secs()),
            });
        }

        Ok(point.price)
    }
}
