use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::access::AccessPolicy;
use crate::config::GateConfig;
use crate::events::EventBus;
use crate::ledger::RestrictionLedger;
use crate::sites::SiteCoordinator;
use crate::storage::durable::CnidariumTier;
use crate::storage::settings::SettingsFileTier;
use crate::storage::TieredStore;
use crate::tab::TabOpener;

/// Top-level composition of the core services. Consumers get these by
/// reference; nothing here is global.
pub struct AppState {
    pub bus: Arc<EventBus>,
    pub ledger: Arc<RestrictionLedger>,
    pub sites: SiteCoordinator,
    pub policy: Arc<AccessPolicy>,
}

impl AppState {
    /// Open the on-disk tiers under `config.data_dir` and wire everything up.
    pub async fn build(config: &GateConfig, opener: Arc<dyn TabOpener>) -> Result<Self> {
        let durable = Arc::new(CnidariumTier::open(&config.data_dir.join("state")).await?);
        let fallback = Arc::new(SettingsFileTier::new(&config.data_dir.join("settings.json")));
        info!("Storage tiers opened at {:?}", config.data_dir);
        let store = Arc::new(TieredStore::new(durable, fallback));
        Ok(Self::with_store(config, store, opener).await)
    }

    pub async fn with_store(
        config: &GateConfig,
        store: Arc<TieredStore>,
        opener: Arc<dyn TabOpener>,
    ) -> Self {
        let bus = Arc::new(EventBus::with_window(config.debounce));

        let ledger = Arc::new(RestrictionLedger::new(store.clone()));
        ledger.ensure_cache_initialized().await;

        let lists = Arc::new(config.access_lists());
        let sites = SiteCoordinator::new(
            bus.clone(),
            ledger.clone(),
            store,
            opener,
            lists.clone(),
            config.verify.clone(),
        );
        sites.load().await;

        let policy = Arc::new(AccessPolicy::new(
            lists,
            ledger.clone(),
            sites.directory(),
            &config.user_patterns,
        ));

        info!(
            static_sites = config.static_sites.len(),
            blocked = config.block_list.len(),
            "Access core initialized"
        );

        Self {
            bus,
            ledger,
            sites,
            policy,
        }
    }
}
