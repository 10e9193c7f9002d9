//! Ledger snapshots and the stores that keep them

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{market::Market, position::AccountBook};

/// Snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported snapshot version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
}

/// Every market and account at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub version: u32,
    pub taken_at: DateTime<Utc>,
    pub markets: Vec<Market>,
    pub accounts: Vec<AccountBook>,
}

impl LedgerSnapshot {
    pub fn new(taken_at: DateTime<Utc>, markets: Vec<Market>, accounts: Vec<AccountBook>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            taken_at,
            markets,
            accounts,
        }
    }
}

/// Storage for ledger snapshots
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), PersistenceError>;

    /// Most recently saved snapshot, if any
    async fn load_latest(&self) -> Result<Option<LedgerSnapshot>, PersistenceError>;
}

/// In-memory store (for testing)
#[derive(Default)]
pub struct InMemoryLedgerStore {
    snapshots: Arc<RwLock<Vec<LedgerSnapshot>>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), PersistenceError> {
        self.snapshots.write().await.push(snapshot.clone());
        Ok(())
    }

    async fn load_latest(&self) -> Result<Option<LedgerSnapshot>, PersistenceError> {
        Ok(self.snapshots.read().await.last().cloned())
    }
}

/// Single JSON document on disk, replaced atomically on save
pub struct JsonFileLedgerStore {
    path: PathBuf,
}

impl JsonFileLedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl LedgerStore for JsonFileLedgerStore {
    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), PersistenceError> {
        let body = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        info!(
            path = %self.path.display(),
            accounts = snapshot.accounts.len(),
            "Ledger snapshot saved"
        );
        Ok(())
    }

    async fn load_latest(&self) -> Result<Option<LedgerSnapshot>, PersistenceError> {
        let body = match tokio::fs::read(&self.path).await {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No ledger snapshot on disk");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let snapshot: LedgerSnapshot = serde_json::from_slice(&body)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(PersistenceError::UnsupportedVersion {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::default_markets,
        types::{AccountId, AssetId},
    };
    use rust_decimal::Decimal;

    fn sample() -> LedgerSnapshot {
        let now = Utc::now();
        let mut market = Market::from_config(&default_markets()[0], now);
        market.total_supplied = Decimal::new(5_123_456_789, 9);

        let mut book = AccountBook::new(AccountId::from("alice"));
        book.position_mut(&AssetId::from("ETH"), now).supplied_amount = market.total_supplied;

        LedgerSnapshot::new(now, vec![market], vec![book])
    }

    #[tokio::test]
    async fn test_in_memory_store_returns_latest() {
        let store = InMemoryLedgerStore::new();
        assert!(store.load_latest().await.unwrap().is_none());

        let first = sample();
        let mut second = sample();
        second.accounts.clear();

        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        assert_eq!(store.len().await, 2);
        assert_eq!(store.load_latest().await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_json_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileLedgerStore::new(dir.path().join("ledger").join("snapshot.json"));
        assert!(store.load_latest().await.unwrap().is_none());

        let snapshot = sample();
        store.save(&snapshot).await.unwrap();

        let loaded = store.load_latest().await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn test_json_file_store_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileLedgerStore::new(dir.path().join("snapshot.json"));

        let mut snapshot = sample();
        snapshot.version = 99;
        store.save(&snapshot).await.unwrap();

        assert!(matches!(
            store.load_latest().await,
            Err(PersistenceError::UnsupportedVersion { found: 99, .. })
        ));
    }
}
