use serde::{Deserialize, Serialize};

use crate::sites::types::SiteStatus;

/// Something that happened in the shell. Events carry no identity beyond
/// their payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShellEvent {
    TabRequested { url: String },
    TabClosed { tab_id: String },
    NavigationBlocked { url: String },
    DownloadProgressed {
        download_id: String,
        received: u64,
        total: Option<u64>,
    },
    DownloadCompleted { download_id: String, path: String },
    DownloadFailed { download_id: String, reason: String },
    SiteAdded {
        site_id: String,
        label: String,
        host: String,
    },
    SiteStatusChanged { site_id: String, status: SiteStatus },
    SiteRemoved { site_id: String, host: String },
    /// Toast-style user notification, scoped to a site when it is about one.
    Notice {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        site_id: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    TabRequested,
    TabClosed,
    NavigationBlocked,
    DownloadProgressed,
    DownloadCompleted,
    DownloadFailed,
    SiteAdded,
    SiteStatusChanged,
    SiteRemoved,
    Notice,
}

impl ShellEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ShellEvent::TabRequested { .. } => EventKind::TabRequested,
            ShellEvent::TabClosed { .. } => EventKind::TabClosed,
            ShellEvent::NavigationBlocked { .. } => EventKind::NavigationBlocked,
            ShellEvent::DownloadProgressed { .. } => EventKind::DownloadProgressed,
            ShellEvent::DownloadCompleted { .. } => EventKind::DownloadCompleted,
            ShellEvent::DownloadFailed { .. } => EventKind::DownloadFailed,
            ShellEvent::SiteAdded { .. } => EventKind::SiteAdded,
            ShellEvent::SiteStatusChanged { .. } => EventKind::SiteStatusChanged,
            ShellEvent::SiteRemoved { .. } => EventKind::SiteRemoved,
            ShellEvent::Notice { .. } => EventKind::Notice,
        }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        ShellEvent::Notice {
            message: message.into(),
            site_id: None,
        }
    }

    pub fn site_notice(site_id: &str, message: impl Into<String>) -> Self {
        ShellEvent::Notice {
            message: message.into(),
            site_id: Some(site_id.to_string()),
        }
    }
}

/// Which events a handler wants to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    Any,
    Only(Vec<EventKind>),
}

impl EventFilter {
    pub fn only(kinds: &[EventKind]) -> Self {
        EventFilter::Only(kinds.to_vec())
    }

    pub fn matches(&self, kind: EventKind) -> bool {
        match self {
            EventFilter::Any => true,
            EventFilter::Only(kinds) => kinds.contains(&kind),
        }
    }
}

/// Debounce identity of an event: variant tag plus a digest of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub kind: EventKind,
    pub digest: blake3::Hash,
}

impl EventKey {
    pub fn of(event: &ShellEvent) -> Self {
        // Serializing a plain enum of strings and integers cannot fail; an
        // empty payload still keys by variant.
        let payload = serde_json::to_vec(event).unwrap_or_default();
        Self {
            kind: event.kind(),
            digest: blake3::hash(&payload),
        }
    }
}
