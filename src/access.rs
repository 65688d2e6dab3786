//! The allow/block predicate consulted before every navigation.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use regex::Regex;
use tracing::{debug, trace, warn};
use url::Url;

use crate::hosts::{host_matches, host_of, normalize_host};
use crate::ledger::RestrictionLedger;
use crate::sites::types::{SiteStatus, StaticSite};
use crate::sites::SiteDirectory;

/// Canonical form used for prefix matching: lowercase scheme and host,
/// default port dropped. Unparseable input is compared as given.
fn canonical_url(raw: &str) -> String {
    match Url::parse(raw.trim()) {
        Ok(url) => url.into(),
        Err(_) => raw.trim().to_string(),
    }
}

fn compile_patterns(sources: &[String]) -> Vec<(String, Regex)> {
    sources
        .iter()
        .filter_map(|src| match Regex::new(src) {
            Ok(re) => Some((src.clone(), re)),
            Err(e) => {
                warn!(pattern = %src, "Skipping invalid allow pattern: {}", e);
                None
            }
        })
        .collect()
}

/// Configured lists: static sites, block-list, global allow patterns and
/// excluded hosts. Immutable after construction.
#[derive(Debug, Default)]
pub struct AccessLists {
    static_sites: Vec<StaticSite>,
    /// Entries containing `://` match as URL prefixes, in canonical form.
    blocked_prefixes: Vec<String>,
    blocked_hosts: HashSet<String>,
    allow_patterns: Vec<(String, Regex)>,
    excluded_hosts: HashSet<String>,
}

impl AccessLists {
    pub fn new(
        static_sites: Vec<StaticSite>,
        block_list: Vec<String>,
        allow_patterns: Vec<String>,
        excluded_hosts: Vec<String>,
    ) -> Self {
        let mut blocked_prefixes = Vec::new();
        let mut blocked_hosts = HashSet::new();
        for entry in block_list {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if entry.contains("://") {
                blocked_prefixes.push(canonical_url(entry));
            } else if let Some(host) = normalize_host(entry) {
                blocked_hosts.insert(host);
            }
        }

        let static_sites = static_sites
            .into_iter()
            .filter_map(|s| {
                let host = normalize_host(&s.host)?;
                Some(StaticSite { label: s.label, host })
            })
            .collect();

        Self {
            static_sites,
            blocked_prefixes,
            blocked_hosts,
            allow_patterns: compile_patterns(&allow_patterns),
            excluded_hosts: excluded_hosts
                .iter()
                .filter_map(|h| normalize_host(h))
                .collect(),
        }
    }

    pub fn static_sites(&self) -> &[StaticSite] {
        &self.static_sites
    }

    pub fn is_blocked(&self, url: &str) -> bool {
        let canonical = canonical_url(url);
        if self
            .blocked_prefixes
            .iter()
            .any(|p| canonical.starts_with(p.as_str()))
        {
            return true;
        }
        match host_of(url) {
            Some(host) => self.blocked_hosts.contains(&host),
            None => false,
        }
    }

    pub fn is_excluded(&self, host: &str) -> bool {
        self.excluded_hosts.contains(host)
    }

    fn static_site_for(&self, host: &str) -> Option<&StaticSite> {
        self.static_sites.iter().find(|s| host_matches(host, &s.host))
    }

    fn allow_pattern_for(&self, url: &str) -> Option<&str> {
        self.allow_patterns
            .iter()
            .find(|(_, re)| re.is_match(url))
            .map(|(src, _)| src.as_str())
    }
}

/// Combines the configured lists, user patterns, the site registry and the
/// restriction ledger into one navigation decision. All reads are from
/// in-memory snapshots.
pub struct AccessPolicy {
    lists: Arc<AccessLists>,
    ledger: Arc<RestrictionLedger>,
    sites: SiteDirectory,
    user_patterns: RwLock<Vec<(String, Regex)>>,
}

impl AccessPolicy {
    pub fn new(
        lists: Arc<AccessLists>,
        ledger: Arc<RestrictionLedger>,
        sites: SiteDirectory,
        user_patterns: &[String],
    ) -> Self {
        Self {
            lists,
            ledger,
            sites,
            user_patterns: RwLock::new(compile_patterns(user_patterns)),
        }
    }

    pub fn is_blocked(&self, url: &str) -> bool {
        self.lists.is_blocked(url)
    }

    pub fn is_allowed(&self, url: &str) -> bool {
        let Some(host) = host_of(url) else {
            debug!(url, "rejected: invalid URL");
            return false;
        };
        if self.lists.is_blocked(url) {
            debug!(url, "rejected: block-listed");
            return false;
        }
        if !self.ledger.can_add_quick(&host) {
            debug!(url, host = %host, "rejected: recently deleted site");
            return false;
        }

        let sites = self.sites.snapshot();
        if let Some(site) = sites.iter().find(|s| {
            s.status == SiteStatus::Completed
                && !s.hidden
                && !self.lists.is_excluded(&s.host)
                && !self.lists.is_blocked(&s.launch_url())
                && host_matches(&host, &s.host)
        }) {
            trace!(url, site_id = %site.id, "allowed: verified site");
            return true;
        }

        if let Some(pattern) = self
            .user_patterns
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(_, re)| re.is_match(url))
            .map(|(src, _)| src.clone())
        {
            trace!(url, pattern = %pattern, "allowed: user pattern");
            return true;
        }

        if let Some(site) = self.lists.static_site_for(&host) {
            trace!(url, label = %site.label, "allowed: static site");
            return true;
        }

        if let Some(pattern) = self.lists.allow_pattern_for(url) {
            trace!(url, pattern, "allowed: global pattern");
            return true;
        }

        debug!(url, "rejected: no matching rule");
        false
    }

    /// Add a user regex. Returns `false` for an invalid or duplicate pattern.
    pub fn add_user_pattern(&self, pattern: &str) -> bool {
        let re = match Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => {
                warn!(pattern, "Rejected invalid user pattern: {}", e);
                return false;
            }
        };
        let mut patterns = self.user_patterns.write().unwrap_or_else(|e| e.into_inner());
        if patterns.iter().any(|(src, _)| src == pattern) {
            return false;
        }
        patterns.push((pattern.to_string(), re));
        true
    }

    pub fn remove_user_pattern(&self, pattern: &str) -> bool {
        let mut patterns = self.user_patterns.write().unwrap_or_else(|e| e.into_inner());
        let before = patterns.len();
        patterns.retain(|(src, _)| src != pattern);
        patterns.len() != before
    }

    pub fn user_patterns(&self) -> Vec<String> {
        self.user_patterns
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(src, _)| src.clone())
            .collect()
    }
}
