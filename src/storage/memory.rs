use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;

use super::StorageTier;

/// Process-local tier. Can be switched into a failing mode to exercise
/// degraded-tier paths.
pub struct MemoryTier {
    name: &'static str,
    entries: Mutex<HashMap<String, Vec<u8>>>,
    writes: Mutex<HashMap<String, usize>>,
    failing: AtomicBool,
}

impl MemoryTier {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Mutex::new(HashMap::new()),
            writes: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Seed a value without counting it as a write.
    pub fn insert(&self, key: &str, value: Vec<u8>) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
    }

    /// Number of successful writes for `key`.
    pub fn writes_for(&self, key: &str) -> usize {
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("{} tier unavailable", self.name);
        }
        Ok(())
    }
}

impl StorageTier for MemoryTier {
    fn name(&self) -> &'static str {
        self.name
    }

    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        async move {
            self.check()?;
            Ok(self.get(key))
        }
        .boxed()
    }

    fn write<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        async move {
            self.check()?;
            self.insert(key, value);
            *self
                .writes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .entry(key.to_string())
                .or_insert(0) += 1;
            Ok(())
        }
        .boxed()
    }
}
