pub mod types;
pub mod verify;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::access::AccessLists;
use crate::events::{EventBus, ShellEvent};
use crate::hosts::{normalize_host, parse_web_url};
use crate::ledger::RestrictionLedger;
use crate::storage::TieredStore;
use crate::tab::TabOpener;
use types::{new_site_id, RegistryDocument, SiteId, SiteRecord, SiteStatus};
use verify::{verify_tab, VerifyConfig, VerifyOutcome};

pub const REGISTRY_KEY: &str = "site_registry";

type Sites = Arc<Vec<SiteRecord>>;

/// Why an add-site request was refused. `Display` is the user-facing text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddSiteError {
    #[error("网站名称不能为空")]
    EmptyLabel,
    #[error("名称“{0}”已被使用")]
    DuplicateLabel(String),
    #[error("无法识别的网址")]
    InvalidUrl,
    #[error("该网址已被屏蔽")]
    Blocked,
    #[error("网站{0}已在列表中")]
    DuplicateHost(String),
    #[error("{0}")]
    Restricted(String),
}

/// Read-only view of the site registry, updated whenever the coordinator
/// publishes a new snapshot.
#[derive(Clone)]
pub struct SiteDirectory {
    rx: watch::Receiver<Sites>,
}

impl SiteDirectory {
    /// Latest published snapshot. Never blocks on the coordinator.
    pub fn snapshot(&self) -> Sites {
        Arc::clone(&self.rx.borrow())
    }

    /// Wait for the next snapshot. Returns `false` once the coordinator is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

struct Inner {
    bus: Arc<EventBus>,
    ledger: Arc<RestrictionLedger>,
    store: Arc<TieredStore>,
    opener: Arc<dyn TabOpener>,
    lists: Arc<AccessLists>,
    verify: VerifyConfig,
    sites: watch::Sender<Sites>,
    jobs: Mutex<HashMap<SiteId, JoinHandle<()>>>,
    /// Serializes user operations (add/delete/retry) against each other.
    ops: Mutex<()>,
    persist_lock: Mutex<()>,
    /// Set while stored registry data exists that could not be read. The
    /// store must not be overwritten until a load succeeds.
    storage_unreadable: AtomicBool,
}

/// Owns the site registry and the verification job of every site.
#[derive(Clone)]
pub struct SiteCoordinator {
    inner: Arc<Inner>,
}

impl SiteCoordinator {
    pub fn new(
        bus: Arc<EventBus>,
        ledger: Arc<RestrictionLedger>,
        store: Arc<TieredStore>,
        opener: Arc<dyn TabOpener>,
        lists: Arc<AccessLists>,
        verify: VerifyConfig,
    ) -> Self {
        let (sites, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            inner: Arc::new(Inner {
                bus,
                ledger,
                store,
                opener,
                lists,
                verify,
                sites,
                jobs: Mutex::new(HashMap::new()),
                ops: Mutex::new(()),
                persist_lock: Mutex::new(()),
                storage_unreadable: AtomicBool::new(false),
            }),
        }
    }

    pub fn directory(&self) -> SiteDirectory {
        SiteDirectory {
            rx: self.inner.sites.subscribe(),
        }
    }

    /// Hydrate the registry from storage and resume verification of sites
    /// left pending by a previous run.
    ///
    /// When the stored registry cannot be read, the in-memory registry is
    /// kept and nothing is written back until a later `load` succeeds. Sites
    /// added in the meantime are merged into the stored ones then.
    pub async fn load(&self) {
        let stored = match self.inner.store.load(REGISTRY_KEY).await {
            Ok(Some(bytes)) => serde_json::from_slice::<RegistryDocument>(&bytes)
                .map(|doc| doc.sites)
                .context("parse site registry"),
            Ok(None) => Ok(Vec::new()),
            Err(e) => Err(e),
        };
        let mut sites = match stored {
            Ok(sites) => sites,
            Err(e) => {
                self.inner.storage_unreadable.store(true, Ordering::SeqCst);
                error!("Failed to load site registry, keeping it read-only: {:#}", e);
                return;
            }
        };

        for site in &mut sites {
            if site.host.is_empty() {
                if let Some(host) = site.original_url.as_deref().and_then(normalize_host) {
                    site.host = host;
                }
            }
        }
        sites.retain(|s| !s.host.is_empty());

        let recovered = self.inner.storage_unreadable.swap(false, Ordering::SeqCst);
        let mut unsaved = 0;
        if recovered {
            for site in self.inner.sites.borrow().iter() {
                if !sites.iter().any(|s| s.id == site.id || s.host == site.host) {
                    sites.push(site.clone());
                    unsaved += 1;
                }
            }
        }

        let pending: Vec<SiteRecord> = sites
            .iter()
            .filter(|s| s.status == SiteStatus::Pending)
            .cloned()
            .collect();
        info!(count = sites.len(), pending = pending.len(), "Site registry loaded");
        self.inner.sites.send_replace(Arc::new(sites));
        if unsaved > 0 {
            info!(unsaved, "Merged sites added while the registry was unreadable");
            self.inner.persist().await;
        }

        for site in pending {
            self.start_job(site).await;
        }
    }

    pub fn get_all_sites_including_hidden(&self) -> Vec<SiteRecord> {
        self.inner.sites.borrow().iter().cloned().collect()
    }

    /// Sites shown to the user: not hidden and not block-listed.
    pub fn get_all_sites(&self) -> Vec<SiteRecord> {
        self.inner
            .sites
            .borrow()
            .iter()
            .filter(|s| !s.hidden && !self.inner.lists.is_blocked(&s.launch_url()))
            .cloned()
            .collect()
    }

    pub fn site(&self, id: &str) -> Option<SiteRecord> {
        self.inner.sites.borrow().iter().find(|s| s.id == id).cloned()
    }

    /// Look a site up by id, then by label (case-insensitive).
    pub fn find(&self, id_or_label: &str) -> Option<SiteRecord> {
        let sites = self.inner.sites.borrow();
        sites
            .iter()
            .find(|s| s.id == id_or_label)
            .or_else(|| {
                let wanted = id_or_label.to_lowercase();
                sites.iter().find(|s| s.label.to_lowercase() == wanted)
            })
            .cloned()
    }

    pub async fn can_add_site_with_details(&self, url: &str) -> (bool, String) {
        self.inner.ledger.can_add_site_with_details(url).await
    }

    pub async fn add_site(&self, label: &str, url: &str) -> Result<SiteRecord, AddSiteError> {
        let label = label.trim();
        if label.is_empty() {
            return Err(AddSiteError::EmptyLabel);
        }
        let parsed = parse_web_url(url).ok_or(AddSiteError::InvalidUrl)?;
        let host = normalize_host(parsed.as_str()).ok_or(AddSiteError::InvalidUrl)?;

        let _ops = self.inner.ops.lock().await;

        let wanted = label.to_lowercase();
        let label_taken = self
            .inner
            .lists
            .static_sites()
            .iter()
            .any(|s| s.label.to_lowercase() == wanted)
            || self
                .inner
                .sites
                .borrow()
                .iter()
                .any(|s| s.label.to_lowercase() == wanted);
        if label_taken {
            return Err(AddSiteError::DuplicateLabel(label.to_string()));
        }
        if self.inner.lists.is_blocked(parsed.as_str()) {
            return Err(AddSiteError::Blocked);
        }
        if self.inner.sites.borrow().iter().any(|s| s.host == host) {
            return Err(AddSiteError::DuplicateHost(host));
        }
        let (allowed, message) = self.inner.ledger.can_add_site_with_details(parsed.as_str()).await;
        if !allowed {
            info!(host = %host, "Add refused by restriction ledger");
            return Err(AddSiteError::Restricted(message));
        }

        let record = SiteRecord {
            id: new_site_id(label, &host),
            label: label.to_string(),
            host: host.clone(),
            status: SiteStatus::Pending,
            original_url: Some(parsed.to_string()),
            hidden: false,
            created_at: chrono::Utc::now().timestamp_millis(),
        };

        self.inner.sites.send_modify(|sites| Arc::make_mut(sites).push(record.clone()));
        self.inner.persist().await;
        info!(site_id = %record.id, label, host = %host, "Site added");

        self.inner.bus.publish(ShellEvent::SiteAdded {
            site_id: record.id.clone(),
            label: record.label.clone(),
            host,
        });
        self.inner.announce(&record);

        self.start_job(record.clone()).await;
        Ok(record)
    }

    /// Remove a site, cancelling its verification first and counting the
    /// delete against its host.
    pub async fn delete_site(&self, id: &str) -> bool {
        let _ops = self.inner.ops.lock().await;
        self.cancel_job(id).await;

        let mut removed = None;
        self.inner.sites.send_if_modified(|sites| {
            match sites.iter().position(|s| s.id == id) {
                Some(index) => {
                    removed = Some(Arc::make_mut(sites).remove(index));
                    true
                }
                None => false,
            }
        });
        let Some(site) = removed else {
            debug!(site_id = id, "delete of unknown site");
            return false;
        };

        let record = self.inner.ledger.record_delete(&site.host).await;
        self.inner.persist().await;
        info!(
            site_id = id,
            host = %site.host,
            delete_count = record.delete_count,
            "Site deleted"
        );

        self.inner.bus.publish(ShellEvent::SiteRemoved {
            site_id: site.id.clone(),
            host: site.host.clone(),
        });
        self.inner
            .bus
            .publish(ShellEvent::site_notice(&site.id, format!("已删除网站“{}”", site.label)));
        true
    }

    /// Re-open verification for a failed or pending site.
    pub async fn retry_site(&self, id: &str) -> bool {
        let _ops = self.inner.ops.lock().await;
        match self.site(id) {
            Some(site) if site.status != SiteStatus::Completed => {}
            Some(_) => {
                debug!(site_id = id, "retry of completed site ignored");
                return false;
            }
            None => return false,
        }

        self.cancel_job(id).await;
        let Some(site) = self.inner.set_status(id, SiteStatus::Pending, |_| true) else {
            return false;
        };
        self.inner.persist().await;
        info!(site_id = id, "Site verification reset");
        self.inner.announce(&site);

        self.start_job(site).await;
        true
    }

    pub async fn set_hidden(&self, id: &str, hidden: bool) -> bool {
        let changed = self.inner.sites.send_if_modified(|sites| {
            match Arc::make_mut(sites).iter_mut().find(|s| s.id == id) {
                Some(site) if site.hidden != hidden => {
                    site.hidden = hidden;
                    true
                }
                _ => false,
            }
        });
        if changed {
            self.inner.persist().await;
            info!(site_id = id, hidden, "Site visibility changed");
        }
        changed
    }

    /// Request a tab for the site. Returns the URL that was requested.
    pub fn open_site(&self, id: &str) -> Option<String> {
        let url = self.site(id)?.launch_url();
        self.inner.bus.publish(ShellEvent::TabRequested { url: url.clone() });
        Some(url)
    }

    /// Cancel every in-flight verification job.
    pub async fn shutdown(&self) {
        let mut jobs = self.inner.jobs.lock().await;
        for (id, job) in jobs.drain() {
            job.abort();
            let _ = job.await;
            debug!(site_id = %id, "verification job cancelled at shutdown");
        }
    }

    async fn start_job(&self, site: SiteRecord) {
        let mut jobs = self.inner.jobs.lock().await;
        jobs.retain(|_, job| !job.is_finished());
        if let Some(old) = jobs.remove(&site.id) {
            old.abort();
            let _ = old.await;
        }
        let id = site.id.clone();
        let task = tokio::spawn(run_verification(Arc::clone(&self.inner), site));
        jobs.insert(id, task);
    }

    async fn cancel_job(&self, id: &str) -> bool {
        let job = self.inner.jobs.lock().await.remove(id);
        match job {
            Some(job) => {
                job.abort();
                let _ = job.await;
                debug!(site_id = id, "verification job cancelled");
                true
            }
            None => false,
        }
    }
}

impl Inner {
    /// Set the status of site `id` if `guard` accepts its current status.
    fn set_status(
        &self,
        id: &str,
        status: SiteStatus,
        guard: impl Fn(SiteStatus) -> bool,
    ) -> Option<SiteRecord> {
        let mut updated = None;
        self.sites.send_if_modified(|sites| {
            match Arc::make_mut(sites).iter_mut().find(|s| s.id == id) {
                Some(site) if guard(site.status) => {
                    site.status = status;
                    updated = Some(site.clone());
                    true
                }
                _ => false,
            }
        });
        updated
    }

    fn announce(&self, site: &SiteRecord) {
        self.bus.publish(ShellEvent::SiteStatusChanged {
            site_id: site.id.clone(),
            status: site.status,
        });
        let message = match site.status {
            SiteStatus::Pending => format!("正在验证网站“{}”", site.label),
            SiteStatus::Completed => format!("网站“{}”验证成功", site.label),
            SiteStatus::Failed => format!("网站“{}”无法访问，可稍后重试", site.label),
        };
        self.bus.publish(ShellEvent::site_notice(&site.id, message));
    }

    /// Write the current registry snapshot to storage. Failures are logged.
    async fn persist(&self) {
        if self.storage_unreadable.load(Ordering::SeqCst) {
            warn!("Site registry not persisted: stored copy could not be read");
            return;
        }
        let _guard = self.persist_lock.lock().await;
        let sites = self.sites.borrow().clone();
        let doc = RegistryDocument {
            sites: sites.iter().cloned().collect(),
        };
        let bytes = match serde_json::to_vec(&doc) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to serialize site registry: {}", e);
                return;
            }
        };
        if let Err(e) = self.store.save(REGISTRY_KEY, bytes).await {
            error!("Failed to persist site registry: {:#}", e);
        }
    }
}

async fn run_verification(inner: Arc<Inner>, site: SiteRecord) {
    let url = site.launch_url();
    info!(site_id = %site.id, url = %url, "Verification started");

    let outcome = match inner.opener.open(&url).await {
        Ok(tab) => verify_tab(&site.id, tab.as_ref(), &inner.verify).await,
        Err(e) => {
            warn!(site_id = %site.id, "Failed to open browsing context: {:#}", e);
            VerifyOutcome::Rejected { attempts: 0 }
        }
    };

    let status = match outcome {
        VerifyOutcome::Accepted { .. } => SiteStatus::Completed,
        VerifyOutcome::Rejected { attempts } => {
            warn!(site_id = %site.id, attempts, "Site failed verification");
            SiteStatus::Failed
        }
    };

    // Only a pending site can be finished; anything else means a newer
    // operation already took over.
    let Some(updated) = inner.set_status(&site.id, status, |s| s == SiteStatus::Pending) else {
        debug!(site_id = %site.id, "stale verification result dropped");
        return;
    };
    inner.persist().await;
    inner.announce(&updated);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryTier;
    use crate::tab::{BrowsingContext, LoadState, NavError, Navigator, TabSnapshot, TabState};
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Plays back scripted snapshots; the last one repeats forever.
    struct ScriptedTab {
        script: StdMutex<Vec<TabSnapshot>>,
        refreshes: Arc<AtomicUsize>,
        reloads: Arc<AtomicUsize>,
    }

    impl TabState for ScriptedTab {
        fn cached(&self) -> TabSnapshot {
            self.script.lock().unwrap()[0].clone()
        }

        fn refresh(&self) -> BoxFuture<'_, TabSnapshot> {
            async move {
                self.refreshes.fetch_add(1, Ordering::SeqCst);
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.remove(0)
                } else {
                    script[0].clone()
                }
            }
            .boxed()
        }
    }

    impl Navigator for ScriptedTab {
        fn reload(&self) {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }
        fn stop_loading(&self) {}
        fn load_url(&self, _url: &str) {}
    }

    struct ScriptedOpener {
        script: Vec<TabSnapshot>,
        refreshes: Arc<AtomicUsize>,
        reloads: Arc<AtomicUsize>,
        opened: Arc<AtomicUsize>,
    }

    impl ScriptedOpener {
        fn new(script: Vec<TabSnapshot>) -> Self {
            Self {
                script,
                refreshes: Arc::new(AtomicUsize::new(0)),
                reloads: Arc::new(AtomicUsize::new(0)),
                opened: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl TabOpener for ScriptedOpener {
        fn open<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, anyhow::Result<Arc<dyn BrowsingContext>>> {
            async move {
                self.opened.fetch_add(1, Ordering::SeqCst);
                let tab = ScriptedTab {
                    script: StdMutex::new(self.script.clone()),
                    refreshes: self.refreshes.clone(),
                    reloads: self.reloads.clone(),
                };
                Ok(Arc::new(tab) as Arc<dyn BrowsingContext>)
            }
            .boxed()
        }
    }

    fn finished(url: &str) -> TabSnapshot {
        TabSnapshot {
            url: Some(url.to_string()),
            load_state: LoadState::Finished,
            errors: vec![],
        }
    }

    fn dns_failure(url: &str) -> TabSnapshot {
        TabSnapshot {
            url: Some(url.to_string()),
            load_state: LoadState::Finished,
            errors: vec![NavError::main_frame(-105, "ERR_NAME_NOT_RESOLVED")],
        }
    }

    fn loading(url: Option<&str>) -> TabSnapshot {
        TabSnapshot {
            url: url.map(str::to_string),
            load_state: LoadState::Loading(40),
            errors: vec![],
        }
    }

    struct Fixture {
        coordinator: SiteCoordinator,
        ledger: Arc<RestrictionLedger>,
        durable: Arc<MemoryTier>,
        opener: Arc<ScriptedOpener>,
    }

    fn fixture(script: Vec<TabSnapshot>, lists: AccessLists) -> Fixture {
        let durable = Arc::new(MemoryTier::new("durable"));
        let fallback = Arc::new(MemoryTier::new("fallback"));
        let store = Arc::new(TieredStore::new(durable.clone(), fallback));
        let ledger = Arc::new(RestrictionLedger::new(store.clone()));
        let opener = Arc::new(ScriptedOpener::new(script));
        let coordinator = SiteCoordinator::new(
            Arc::new(EventBus::new()),
            ledger.clone(),
            store,
            opener.clone(),
            Arc::new(lists),
            VerifyConfig::default(),
        );
        Fixture {
            coordinator,
            ledger,
            durable,
            opener,
        }
    }

    async fn run_for(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_clean_check_completes() {
        let f = fixture(vec![finished("https://example.com/")], AccessLists::default());
        let site = f.coordinator.add_site("Example", "https://example.com").await.unwrap();
        assert_eq!(site.status, SiteStatus::Pending);
        assert_eq!(site.host, "example.com");

        run_for(5).await;
        assert_eq!(f.coordinator.site(&site.id).unwrap().status, SiteStatus::Completed);
        assert_eq!(f.opener.refreshes.load(Ordering::SeqCst), 1);

        let stored: RegistryDocument =
            serde_json::from_slice(&f.durable.get(REGISTRY_KEY).unwrap()).unwrap();
        assert_eq!(stored.sites[0].status, SiteStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_three_attempts() {
        let f = fixture(vec![dns_failure("https://nowhere.example/")], AccessLists::default());
        let site = f.coordinator.add_site("Nowhere", "nowhere.example").await.unwrap();

        run_for(120).await;
        assert_eq!(f.coordinator.site(&site.id).unwrap().status, SiteStatus::Failed);
        assert_eq!(f.opener.refreshes.load(Ordering::SeqCst), 3);
        assert_eq!(f.opener.reloads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_a_later_attempt() {
        let f = fixture(
            vec![dns_failure("https://example.com/"), finished("https://example.com/")],
            AccessLists::default(),
        );
        let site = f.coordinator.add_site("Example", "https://example.com").await.unwrap();
        run_for(10).await;
        assert_eq!(f.coordinator.site(&site.id).unwrap().status, SiteStatus::Completed);
        assert_eq!(f.opener.reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_page_counts_as_failure() {
        let f = fixture(vec![finished("https://example.com/404")], AccessLists::default());
        let site = f.coordinator.add_site("Example", "https://example.com").await.unwrap();
        run_for(120).await;
        assert_eq!(f.coordinator.site(&site.id).unwrap().status, SiteStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_page_with_url_is_accepted_while_loading() {
        let f = fixture(vec![loading(Some("https://slow.example/"))], AccessLists::default());
        let site = f.coordinator.add_site("Slow", "https://slow.example").await.unwrap();

        run_for(6).await;
        assert_eq!(f.coordinator.site(&site.id).unwrap().status, SiteStatus::Pending);
        run_for(10).await;
        assert_eq!(f.coordinator.site(&site.id).unwrap().status, SiteStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_endless_loading_without_url_terminates() {
        let f = fixture(vec![loading(None)], AccessLists::default());
        let site = f.coordinator.add_site("Stuck", "https://stuck.example").await.unwrap();
        run_for(300).await;
        assert_eq!(f.coordinator.site(&site.id).unwrap().status, SiteStatus::Failed);
        assert_eq!(f.opener.reloads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_cancels_job_and_records_restriction() {
        let f = fixture(vec![loading(None)], AccessLists::default());
        let site = f.coordinator.add_site("Example", "https://example.com").await.unwrap();
        run_for(3).await;

        assert!(f.coordinator.delete_site(&site.id).await);
        assert!(f.coordinator.site(&site.id).is_none());
        assert!(!f.coordinator.delete_site(&site.id).await);
        assert_eq!(f.ledger.record("example.com").await.unwrap().delete_count, 1);

        let refreshes = f.opener.refreshes.load(Ordering::SeqCst);
        run_for(60).await;
        assert_eq!(f.opener.refreshes.load(Ordering::SeqCst), refreshes);

        let err = f.coordinator.add_site("Example", "https://example.com").await.unwrap_err();
        match err {
            AddSiteError::Restricted(msg) => {
                assert!(msg.contains("1次"));
                assert!(msg.contains("月内无法再添加"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_reopens_failed_site() {
        let f = fixture(vec![dns_failure("https://example.com/")], AccessLists::default());
        let site = f.coordinator.add_site("Example", "https://example.com").await.unwrap();
        run_for(120).await;
        assert_eq!(f.coordinator.site(&site.id).unwrap().status, SiteStatus::Failed);

        assert!(f.coordinator.retry_site(&site.id).await);
        assert_eq!(f.coordinator.site(&site.id).unwrap().status, SiteStatus::Pending);

        run_for(120).await;
        assert_eq!(f.coordinator.site(&site.id).unwrap().status, SiteStatus::Failed);
        assert_eq!(f.opener.opened.load(Ordering::SeqCst), 2);
        assert_eq!(f.opener.refreshes.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_validation() {
        let lists = AccessLists::new(
            vec![types::StaticSite {
                label: "News".to_string(),
                host: "news.example".to_string(),
            }],
            vec!["blocked.example".to_string()],
            vec![],
            vec![],
        );
        let f = fixture(vec![finished("https://example.com/")], lists);

        assert_eq!(f.coordinator.add_site("  ", "https://a.example").await, Err(AddSiteError::EmptyLabel));
        assert_eq!(f.coordinator.add_site("A", "ftp://a.example").await, Err(AddSiteError::InvalidUrl));
        assert_eq!(
            f.coordinator.add_site("news", "https://a.example").await,
            Err(AddSiteError::DuplicateLabel("news".to_string()))
        );
        assert_eq!(f.coordinator.add_site("B", "https://blocked.example/x").await, Err(AddSiteError::Blocked));

        f.coordinator.add_site("Example", "https://example.com").await.unwrap();
        assert_eq!(
            f.coordinator.add_site("EXAMPLE", "https://other.example").await,
            Err(AddSiteError::DuplicateLabel("EXAMPLE".to_string()))
        );
        assert_eq!(
            f.coordinator.add_site("Second", "https://example.com/other").await,
            Err(AddSiteError::DuplicateHost("example.com".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_and_blocked_sites_are_not_listed() {
        let lists = AccessLists::new(vec![], vec!["https://blocked.example/".to_string()], vec![], vec![]);
        let f = fixture(vec![finished("https://example.com/")], lists);
        let a = f.coordinator.add_site("A", "https://a.example").await.unwrap();
        f.coordinator.add_site("B", "https://b.example").await.unwrap();

        assert!(f.coordinator.set_hidden(&a.id, true).await);
        assert!(!f.coordinator.set_hidden(&a.id, true).await);
        let visible: Vec<String> = f.coordinator.get_all_sites().into_iter().map(|s| s.label).collect();
        assert_eq!(visible, vec!["B".to_string()]);
        assert_eq!(f.coordinator.get_all_sites_including_hidden().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_survives_reload_and_resumes_pending() {
        let f = fixture(vec![loading(None)], AccessLists::default());
        let site = f.coordinator.add_site("Example", "https://example.com").await.unwrap();
        f.coordinator.shutdown().await;

        let reopened = SiteCoordinator::new(
            Arc::new(EventBus::new()),
            f.ledger.clone(),
            f.coordinator.inner.store.clone(),
            Arc::new(ScriptedOpener::new(vec![finished("https://example.com/")])),
            Arc::new(AccessLists::default()),
            VerifyConfig::default(),
        );
        reopened.load().await;
        assert_eq!(reopened.site(&site.id).unwrap().status, SiteStatus::Pending);
        run_for(5).await;
        assert_eq!(reopened.site(&site.id).unwrap().status, SiteStatus::Completed);
        assert_eq!(reopened.find("example").unwrap().id, site.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_site_requests_tab() {
        let f = fixture(vec![finished("https://example.com/")], AccessLists::default());
        let site = f.coordinator.add_site("Example", "https://example.com/home").await.unwrap();
        assert_eq!(f.coordinator.open_site(&site.id).as_deref(), Some("https://example.com/home"));
        assert_eq!(f.coordinator.open_site("missing"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_registry_is_not_overwritten() {
        let f = fixture(vec![finished("https://example.com/")], AccessLists::default());
        f.durable.insert(REGISTRY_KEY, b"{not json".to_vec());
        f.coordinator.load().await;
        assert!(f.coordinator.get_all_sites_including_hidden().is_empty());

        let added = f.coordinator.add_site("Example", "https://example.com").await.unwrap();
        run_for(5).await;
        assert_eq!(f.durable.get(REGISTRY_KEY), Some(b"{not json".to_vec()));

        let stored = SiteRecord {
            id: "stored".to_string(),
            label: "Stored".to_string(),
            host: "stored.example".to_string(),
            status: SiteStatus::Completed,
            original_url: Some("https://stored.example/".to_string()),
            hidden: false,
            created_at: 0,
        };
        let doc = RegistryDocument {
            sites: vec![stored.clone()],
        };
        f.durable.insert(REGISTRY_KEY, serde_json::to_vec(&doc).unwrap());
        f.coordinator.load().await;

        let ids: Vec<String> = f
            .coordinator
            .get_all_sites_including_hidden()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![stored.id.clone(), added.id.clone()]);
        let persisted: RegistryDocument =
            serde_json::from_slice(&f.durable.get(REGISTRY_KEY).unwrap()).unwrap();
        assert_eq!(persisted.sites.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_jobs_are_pruned() {
        let f = fixture(vec![finished("https://example.com/")], AccessLists::default());
        f.coordinator.add_site("A", "https://a.example").await.unwrap();
        f.coordinator.add_site("B", "https://b.example").await.unwrap();
        run_for(5).await;

        f.coordinator.add_site("C", "https://c.example").await.unwrap();
        assert_eq!(f.coordinator.inner.jobs.lock().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_notices_are_scoped_to_the_site() {
        let f = fixture(vec![finished("https://example.com/")], AccessLists::default());
        let notices = Arc::new(StdMutex::new(Vec::new()));
        let sink = notices.clone();
        f.coordinator
            .inner
            .bus
            .register_handler("toast", crate::events::EventFilter::Any, move |event| {
                let sink = sink.clone();
                async move {
                    if let ShellEvent::Notice { site_id, .. } = event {
                        sink.lock().unwrap().push(site_id);
                    }
                    Ok(())
                }
            })
            .await;

        let site = f.coordinator.add_site("Example", "https://example.com").await.unwrap();
        run_for(5).await;
        assert_eq!(
            *notices.lock().unwrap(),
            vec![Some(site.id.clone()), Some(site.id.clone())]
        );
    }
}
