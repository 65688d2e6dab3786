use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::StorageTier;

/// Fallback tier: a flat JSON settings file mapping keys to string values.
pub struct SettingsFileTier {
    path: PathBuf,
    /// Serializes read-modify-write cycles on the file.
    lock: Mutex<()>,
}

impl SettingsFileTier {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    async fn read_map(&self) -> Result<BTreeMap<String, String>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parse settings file {:?}", self.path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e).with_context(|| format!("read settings file {:?}", self.path)),
        }
    }

    async fn write_map(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("create settings directory")?;
        }
        let bytes = serde_json::to_vec_pretty(map).context("serialize settings")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("write {:?}", tmp))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replace {:?}", self.path))?;
        Ok(())
    }
}

impl StorageTier for SettingsFileTier {
    fn name(&self) -> &'static str {
        "settings"
    }

    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        async move {
            let _guard = self.lock.lock().await;
            let map = self.read_map().await?;
            Ok(map.get(key).map(|v| v.as_bytes().to_vec()))
        }
        .boxed()
    }

    fn write<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        async move {
            let text = String::from_utf8(value).context("settings values must be UTF-8")?;
            let _guard = self.lock.lock().await;
            let mut map = self.read_map().await?;
            map.insert(key.to_string(), text);
            self.write_map(&map).await?;
            debug!(key, path = ?self.path, "settings written");
            Ok(())
        }
        .boxed()
    }
}
