pub mod types;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info, warn};

use crate::hosts::normalize_host;
use crate::storage::TieredStore;
use types::{LedgerDocument, Restriction, RestrictionRecord};

pub const LEDGER_KEY: &str = "restriction_ledger";

/// Ledger key for a host, URL or opaque id.
fn ledger_key(host_or_id: &str) -> String {
    normalize_host(host_or_id).unwrap_or_else(|| host_or_id.trim().to_ascii_lowercase())
}

/// Per-host delete history with a lazily hydrated in-memory cache. The cache
/// is the only thing `can_add_quick` reads.
///
/// Until storage has been read once, deletes are only counted in memory;
/// they are folded into the stored history by the first successful load.
pub struct RestrictionLedger {
    store: Arc<TieredStore>,
    cache: RwLock<HashMap<String, RestrictionRecord>>,
    /// Filled by the first successful load only.
    init: OnceCell<()>,
    /// Serializes read-modify-write of the ledger document.
    write_lock: Mutex<()>,
}

impl RestrictionLedger {
    pub fn new(store: Arc<TieredStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            init: OnceCell::new(),
            write_lock: Mutex::new(()),
        }
    }

    async fn load_records(&self) -> Result<HashMap<String, RestrictionRecord>> {
        let Some(bytes) = self.store.load(LEDGER_KEY).await? else {
            return Ok(HashMap::new());
        };
        let doc: LedgerDocument =
            serde_json::from_slice(&bytes).context("parse restriction ledger")?;
        Ok(doc
            .records
            .into_iter()
            .filter(|r| r.delete_count > 0)
            .map(|r| (r.host_or_id.clone(), r))
            .collect())
    }

    fn replace_cache(&self, records: HashMap<String, RestrictionRecord>) {
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = records;
    }

    /// Hydrate the cache from storage. Returns `false` while storage cannot
    /// be read; the next call tries again.
    pub async fn ensure_cache_initialized(&self) -> bool {
        let result = self
            .init
            .get_or_try_init(|| async {
                let _guard = self.write_lock.lock().await;
                let stored = self.load_records().await?;
                info!(count = stored.len(), "Restriction ledger loaded");
                if let Some(merged) = self.merge_unsaved(stored) {
                    if let Err(e) = self.persist(&merged).await {
                        error!("Failed to persist merged restriction ledger: {:#}", e);
                    }
                }
                anyhow::Ok(())
            })
            .await;
        match result {
            Ok(_) => true,
            Err(e) => {
                error!("Failed to load restriction ledger: {:#}", e);
                false
            }
        }
    }

    /// Install `stored` as the cache, adding deletes counted before storage
    /// was readable. Returns the merged map when there were any.
    fn merge_unsaved(
        &self,
        mut stored: HashMap<String, RestrictionRecord>,
    ) -> Option<HashMap<String, RestrictionRecord>> {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        let unsaved = std::mem::take(&mut *cache);
        let merged = !unsaved.is_empty();
        for (key, pending) in unsaved {
            stored
                .entry(key)
                .and_modify(|r| {
                    r.delete_count += pending.delete_count;
                    r.last_delete_time = r.last_delete_time.max(pending.last_delete_time);
                })
                .or_insert(pending);
        }
        *cache = stored;
        if merged {
            info!(count = cache.len(), "Merged unsaved deletes into restriction ledger");
            Some(cache.clone())
        } else {
            None
        }
    }

    /// Re-read storage into the cache, keeping the cache on failure.
    pub async fn reload(&self) {
        if !self.init.initialized() {
            self.ensure_cache_initialized().await;
            return;
        }
        let _guard = self.write_lock.lock().await;
        match self.load_records().await {
            Ok(records) => {
                debug!(count = records.len(), "Restriction ledger reloaded");
                self.replace_cache(records);
            }
            Err(e) => error!("Failed to reload restriction ledger: {:#}", e),
        }
    }

    /// Count one more delete for `host` and persist it.
    pub async fn record_delete(&self, host: &str) -> RestrictionRecord {
        self.record_delete_at(host, Utc::now()).await
    }

    pub async fn record_delete_at(&self, host: &str, now: DateTime<Utc>) -> RestrictionRecord {
        let loaded = self.ensure_cache_initialized().await;
        let _guard = self.write_lock.lock().await;

        let key = ledger_key(host);
        let mut records = self.cache.read().unwrap_or_else(|e| e.into_inner()).clone();
        let record = records
            .entry(key.clone())
            .and_modify(|r| {
                r.delete_count += 1;
                r.last_delete_time = now.timestamp_millis();
            })
            .or_insert_with(|| RestrictionRecord {
                host_or_id: key.clone(),
                delete_count: 1,
                last_delete_time: now.timestamp_millis(),
            })
            .clone();

        if !loaded {
            warn!(host = %key, "Restriction ledger unreadable, delete kept in memory");
        } else if let Err(e) = self.persist(&records).await {
            // The cache still enforces the restriction for this process.
            error!(host = %key, "Failed to persist restriction ledger: {:#}", e);
        }
        self.replace_cache(records);

        info!(
            host = %key,
            delete_count = record.delete_count,
            "Site delete recorded"
        );
        record
    }

    async fn persist(&self, records: &HashMap<String, RestrictionRecord>) -> Result<()> {
        let mut list: Vec<RestrictionRecord> = records.values().cloned().collect();
        list.sort_by(|a, b| a.host_or_id.cmp(&b.host_or_id));
        let bytes = serde_json::to_vec(&LedgerDocument { records: list })
            .context("serialize restriction ledger")?;
        self.store.save(LEDGER_KEY, bytes).await
    }

    /// Cached restriction for `host`.
    pub fn restriction_at(&self, host: &str, now: DateTime<Utc>) -> Restriction {
        let key = ledger_key(host);
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .map(|r| r.restriction_at(now))
            .unwrap_or(Restriction::None)
    }

    /// Cache-only check; never awaits.
    pub fn can_add_quick(&self, host: &str) -> bool {
        self.restriction_at(host, Utc::now()) == Restriction::None
    }

    pub async fn can_add(&self, host: &str) -> bool {
        self.can_add_at(host, Utc::now()).await
    }

    pub async fn can_add_at(&self, host: &str, now: DateTime<Utc>) -> bool {
        self.ensure_cache_initialized().await;
        self.restriction_at(host, now) == Restriction::None
    }

    pub async fn record(&self, host: &str) -> Option<RestrictionRecord> {
        self.ensure_cache_initialized().await;
        let key = ledger_key(host);
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
    }

    /// All records, most recently deleted first.
    pub async fn records(&self) -> Vec<RestrictionRecord> {
        self.ensure_cache_initialized().await;
        let mut list: Vec<RestrictionRecord> = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| b.last_delete_time.cmp(&a.last_delete_time));
        list
    }

    pub async fn restriction_message(&self, host: &str) -> String {
        self.restriction_message_at(host, Utc::now()).await
    }

    pub async fn restriction_message_at(&self, host: &str, now: DateTime<Utc>) -> String {
        match self.record(host).await {
            Some(record) => restriction_message(&record, now),
            None => String::new(),
        }
    }

    /// User-facing feedback for an add attempt: `(allowed, message)`.
    pub async fn can_add_site_with_details(&self, url: &str) -> (bool, String) {
        self.can_add_site_with_details_at(url, Utc::now()).await
    }

    pub async fn can_add_site_with_details_at(
        &self,
        url: &str,
        now: DateTime<Utc>,
    ) -> (bool, String) {
        let Some(host) = normalize_host(url) else {
            warn!(url, "Add attempt with unrecognized URL");
            return (false, "无法识别的网址".to_string());
        };
        if self.can_add_at(&host, now).await {
            (true, String::new())
        } else {
            (false, self.restriction_message_at(&host, now).await)
        }
    }
}

/// Human-readable restriction text; empty when the host may be added.
pub fn restriction_message(record: &RestrictionRecord, now: DateTime<Utc>) -> String {
    match record.restriction_at(now) {
        Restriction::None => String::new(),
        Restriction::Permanent => {
            format!("该网站已被删除{}次，永久无法再添加", record.delete_count)
        }
        Restriction::Until(deadline) => {
            let period = if record.delete_count == 1 {
                "1个月"
            } else {
                "6个月"
            };
            let minutes = (deadline - now).num_minutes().max(1);
            let hours = (minutes + 59) / 60;
            let remaining = if hours >= 24 {
                format!("{}天", (hours + 23) / 24)
            } else {
                format!("{}小时", hours)
            };
            format!(
                "该网站已被删除{}次，{}内无法再添加，剩余{}",
                record.delete_count, period, remaining
            )
        }
    }
}
