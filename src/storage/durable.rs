use std::path::Path;

use anyhow::{Context, Result};
use cnidarium::{StateDelta, StateRead, StateWrite, Storage};
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use super::StorageTier;

// Substore prefix, no trailing slash
const GATE_PREFIX: &str = "gate";

fn gate_key(name: &str) -> String {
    format!("{}/{}", GATE_PREFIX, name)
}

/// Durable tier backed by a cnidarium store.
pub struct CnidariumTier {
    storage: Storage,
}

impl CnidariumTier {
    pub async fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let storage = Storage::load(data_dir.to_path_buf(), vec![GATE_PREFIX.to_string()])
            .await
            .context("Failed to init cnidarium storage")?;
        Ok(Self { storage })
    }
}

impl StorageTier for CnidariumTier {
    fn name(&self) -> &'static str {
        "cnidarium"
    }

    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        async move {
            let snapshot = self.storage.latest_snapshot();
            let value = snapshot
                .get_raw(&gate_key(key))
                .await
                .with_context(|| format!("read {}", key))?;
            Ok(value)
        }
        .boxed()
    }

    fn write<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        async move {
            let size = value.len();
            let snapshot = self.storage.latest_snapshot();
            let mut delta = StateDelta::new(snapshot);
            delta.put_raw(gate_key(key), value);
            self.storage
                .commit(delta)
                .await
                .with_context(|| format!("commit {}", key))?;
            debug!(key, size, "durable value committed");
            Ok(())
        }
        .boxed()
    }
}
