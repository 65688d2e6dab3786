pub mod durable;
pub mod memory;
pub mod settings;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

/// One persistence backend for named blobs.
pub trait StorageTier: Send + Sync {
    fn name(&self) -> &'static str;

    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>>;

    fn write<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<()>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierHealth {
    Healthy,
    /// The last durable write for this key failed; the fallback copy is newer.
    Degraded,
}

fn degraded_key(key: &str) -> String {
    format!("{}.durable_degraded", key)
}

/// Two-tier store: every save goes to both tiers, loads prefer the durable
/// tier and migrate fallback-only data into it.
pub struct TieredStore {
    durable: Arc<dyn StorageTier>,
    fallback: Arc<dyn StorageTier>,
    health: Mutex<HashMap<String, TierHealth>>,
}

impl TieredStore {
    pub fn new(durable: Arc<dyn StorageTier>, fallback: Arc<dyn StorageTier>) -> Self {
        Self {
            durable,
            fallback,
            health: Mutex::new(HashMap::new()),
        }
    }

    /// Tier health for `key`, consulting the persisted flag on first use.
    pub async fn health(&self, key: &str) -> TierHealth {
        if let Some(h) = self.cached_health(key) {
            return h;
        }
        let health = match self.fallback.read(&degraded_key(key)).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<bool>(&bytes) {
                Ok(true) => TierHealth::Degraded,
                Ok(false) => TierHealth::Healthy,
                Err(e) => {
                    warn!(key, "Unreadable tier health flag: {}", e);
                    TierHealth::Healthy
                }
            },
            Ok(None) => TierHealth::Healthy,
            Err(e) => {
                warn!(key, tier = self.fallback.name(), "Failed to read tier health flag: {}", e);
                TierHealth::Healthy
            }
        };
        self.set_cached_health(key, health);
        health
    }

    fn cached_health(&self, key: &str) -> Option<TierHealth> {
        self.health
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
    }

    fn set_cached_health(&self, key: &str, health: TierHealth) {
        self.health
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), health);
    }

    async fn mark(&self, key: &str, health: TierHealth) {
        let previous = self.cached_health(key);
        self.set_cached_health(key, health);
        if previous == Some(health) {
            return;
        }
        let flag = serde_json::to_vec(&(health == TierHealth::Degraded)).unwrap_or_default();
        if let Err(e) = self.fallback.write(&degraded_key(key), flag).await {
            warn!(key, tier = self.fallback.name(), "Failed to persist tier health flag: {}", e);
        }
        match health {
            TierHealth::Degraded => warn!(key, tier = self.durable.name(), "Durable tier marked degraded"),
            TierHealth::Healthy => info!(key, tier = self.durable.name(), "Durable tier healthy again"),
        }
    }

    /// Load `key`. Fallback-only data is written through to the durable tier
    /// once; a degraded key reads the fallback copy first since it is newer.
    pub async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let degraded = self.health(key).await == TierHealth::Degraded;

        if !degraded {
            match self.durable.read(key).await {
                Ok(Some(bytes)) => {
                    debug!(key, tier = self.durable.name(), size = bytes.len(), "loaded");
                    return Ok(Some(bytes));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(key, tier = self.durable.name(), "Durable read failed: {}", e);
                    self.mark(key, TierHealth::Degraded).await;
                }
            }
        }

        match self.fallback.read(key).await {
            Ok(Some(bytes)) => {
                debug!(key, tier = self.fallback.name(), size = bytes.len(), "loaded");
                match self.durable.write(key, bytes.clone()).await {
                    Ok(()) => {
                        info!(key, size = bytes.len(), "Migrated fallback data into durable tier");
                        self.mark(key, TierHealth::Healthy).await;
                    }
                    Err(e) => {
                        warn!(key, tier = self.durable.name(), "Migration write failed: {}", e);
                        self.mark(key, TierHealth::Degraded).await;
                    }
                }
                Ok(Some(bytes))
            }
            Ok(None) if degraded => {
                // Flag set but nothing in the fallback: the durable copy is all there is.
                self.durable.read(key).await
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(key, tier = self.fallback.name(), "Fallback read failed: {}", e);
                if degraded {
                    self.durable.read(key).await
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Write `value` to both tiers. Errors only when neither tier accepted it.
    pub async fn save(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let fallback = self.fallback.write(key, value.clone()).await;
        if let Err(e) = &fallback {
            warn!(key, tier = self.fallback.name(), "Fallback write failed: {}", e);
        }

        match self.durable.write(key, value).await {
            Ok(()) => {
                self.mark(key, TierHealth::Healthy).await;
                Ok(())
            }
            Err(e) => {
                warn!(key, tier = self.durable.name(), "Durable write failed: {}", e);
                self.mark(key, TierHealth::Degraded).await;
                fallback.map_err(|fe| anyhow::anyhow!("both tiers failed for {}: {}; {}", key, e, fe))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryTier;
    use super::*;

    fn tiers() -> (Arc<MemoryTier>, Arc<MemoryTier>, TieredStore) {
        let durable = Arc::new(MemoryTier::new("durable"));
        let fallback = Arc::new(MemoryTier::new("fallback"));
        let store = TieredStore::new(durable.clone(), fallback.clone());
        (durable, fallback, store)
    }

    #[tokio::test]
    async fn test_save_writes_both_tiers() {
        let (durable, fallback, store) = tiers();
        store.save("doc", b"v1".to_vec()).await.unwrap();
        assert_eq!(durable.get("doc"), Some(b"v1".to_vec()));
        assert_eq!(fallback.get("doc"), Some(b"v1".to_vec()));
        assert_eq!(store.health("doc").await, TierHealth::Healthy);
    }

    #[tokio::test]
    async fn test_migration_happens_once() {
        let (durable, fallback, store) = tiers();
        fallback.insert("doc", b"legacy".to_vec());

        assert_eq!(store.load("doc").await.unwrap(), Some(b"legacy".to_vec()));
        assert_eq!(durable.writes_for("doc"), 1);
        assert_eq!(store.load("doc").await.unwrap(), Some(b"legacy".to_vec()));
        assert_eq!(store.load("doc").await.unwrap(), Some(b"legacy".to_vec()));
        assert_eq!(durable.writes_for("doc"), 1);
    }

    #[tokio::test]
    async fn test_durable_failure_is_recovered_from_fallback() {
        let (durable, fallback, store) = tiers();
        store.save("doc", b"v1".to_vec()).await.unwrap();

        durable.set_failing(true);
        store.save("doc", b"v2".to_vec()).await.unwrap();
        assert_eq!(store.health("doc").await, TierHealth::Degraded);
        assert_eq!(fallback.get("doc.durable_degraded"), Some(b"true".to_vec()));

        // A fresh store sees the persisted flag and prefers the newer fallback copy.
        durable.set_failing(false);
        let reopened = TieredStore::new(durable.clone(), fallback.clone());
        assert_eq!(reopened.load("doc").await.unwrap(), Some(b"v2".to_vec()));
        assert_eq!(durable.get("doc"), Some(b"v2".to_vec()));
        assert_eq!(reopened.health("doc").await, TierHealth::Healthy);
    }

    #[tokio::test]
    async fn test_save_fails_only_when_both_tiers_fail() {
        let (durable, fallback, store) = tiers();
        fallback.set_failing(true);
        assert!(store.save("doc", b"v".to_vec()).await.is_ok());
        durable.set_failing(true);
        assert!(store.save("doc", b"v".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn test_load_missing_key() {
        let (_, _, store) = tiers();
        assert_eq!(store.load("absent").await.unwrap(), None);
    }
}
