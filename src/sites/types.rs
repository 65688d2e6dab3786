use serde::{Deserialize, Serialize};

/// Opaque site identifier (blake3-derived hex).
pub type SiteId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SiteStatus {
    Pending,
    Completed,
    Failed,
}

impl std::fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SiteStatus::Pending => "pending",
            SiteStatus::Completed => "completed",
            SiteStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A site the user asked to add.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteRecord {
    pub id: SiteId,
    pub label: String,
    /// Normalized hostname: no scheme, port or path.
    pub host: String,
    pub status: SiteStatus,
    #[serde(default)]
    pub original_url: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub created_at: i64,
}

impl SiteRecord {
    /// URL to open for this site.
    pub fn launch_url(&self) -> String {
        match &self.original_url {
            Some(url) => url.clone(),
            None => format!("https://{}", self.host),
        }
    }
}

/// A statically configured allow-listed site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticSite {
    pub label: String,
    pub host: String,
}

/// Persisted form of the site registry.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub sites: Vec<SiteRecord>,
}

pub(crate) fn new_site_id(label: &str, host: &str) -> SiteId {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let seed = format!("{}|{}|{}", label, host, nanos);
    blake3::hash(seed.as_bytes()).to_hex()[..16].to_string()
}
