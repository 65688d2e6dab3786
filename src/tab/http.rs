use std::error::Error as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{BrowsingContext, LoadState, NavError, Navigator, TabOpener, TabSnapshot, TabState};

/// Opens headless tabs that fetch the page over HTTP instead of rendering it.
pub struct HttpTabOpener {
    client: reqwest::Client,
}

impl HttpTabOpener {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

impl TabOpener for HttpTabOpener {
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Arc<dyn BrowsingContext>>> {
        async move {
            let tab = HttpTab::new(self.client.clone());
            tab.load_url(url);
            Ok(Arc::new(tab) as Arc<dyn BrowsingContext>)
        }
        .boxed()
    }
}

struct Inner {
    target: String,
    snapshot: TabSnapshot,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

pub struct HttpTab {
    client: reqwest::Client,
    inner: Arc<Mutex<Inner>>,
}

impl HttpTab {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            inner: Arc::new(Mutex::new(Inner {
                target: String::new(),
                snapshot: TabSnapshot::initializing(),
                generation: 0,
                task: None,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Map a transport failure onto the engine's network error codes.
fn nav_error_for(err: &reqwest::Error) -> NavError {
    if err.is_timeout() {
        return NavError::main_frame(-118, "ERR_CONNECTION_TIMED_OUT");
    }
    let mut chain = String::new();
    let mut source = err.source();
    while let Some(e) = source {
        chain.push_str(&e.to_string().to_lowercase());
        chain.push(' ');
        source = e.source();
    }
    if chain.contains("dns") || chain.contains("resolve") || chain.contains("lookup") {
        NavError::main_frame(-105, "ERR_NAME_NOT_RESOLVED")
    } else if chain.contains("reset") {
        NavError::main_frame(-101, "ERR_CONNECTION_RESET")
    } else if err.is_connect() {
        NavError::main_frame(-102, "ERR_CONNECTION_REFUSED")
    } else {
        NavError::main_frame(-2, "ERR_FAILED")
    }
}

async fn fetch(client: reqwest::Client, inner: Arc<Mutex<Inner>>, url: String, generation: u64) {
    let snapshot = match client.get(&url).send().await {
        Ok(resp) => {
            let status = resp.status();
            let mut errors = Vec::new();
            if !status.is_success() {
                errors.push(NavError::main_frame(
                    i32::from(status.as_u16()),
                    &format!("HTTP_{}", status.as_u16()),
                ));
            }
            TabSnapshot {
                url: Some(resp.url().to_string()),
                load_state: LoadState::Finished,
                errors,
            }
        }
        Err(e) => {
            debug!(url = %url, "fetch failed: {}", e);
            TabSnapshot {
                url: Some(url.clone()),
                load_state: LoadState::Finished,
                errors: vec![nav_error_for(&e)],
            }
        }
    };

    let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
    // A newer navigation supersedes this one.
    if inner.generation == generation {
        debug!(url = %url, state = ?snapshot.load_state, errors = snapshot.errors.len(), "tab load settled");
        inner.snapshot = snapshot;
    }
}

impl TabState for HttpTab {
    fn cached(&self) -> TabSnapshot {
        self.lock().snapshot.clone()
    }

    fn refresh(&self) -> BoxFuture<'_, TabSnapshot> {
        // The fetch task pushes its result; there is nothing further to pull.
        async move { self.cached() }.boxed()
    }
}

impl Navigator for HttpTab {
    fn reload(&self) {
        let target = self.lock().target.clone();
        if !target.is_empty() {
            self.load_url(&target);
        }
    }

    fn stop_loading(&self) {
        let mut inner = self.lock();
        inner.generation += 1;
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        if inner.snapshot.load_state != LoadState::Finished {
            inner.snapshot.load_state = LoadState::Stopped;
        }
    }

    fn load_url(&self, url: &str) {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.target = url.to_string();
        inner.snapshot = TabSnapshot {
            url: None,
            load_state: LoadState::Loading(0),
            errors: Vec::new(),
        };
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let task = handle.spawn(fetch(
                    self.client.clone(),
                    Arc::clone(&self.inner),
                    url.to_string(),
                    inner.generation,
                ));
                inner.task = Some(task);
            }
            Err(_) => inner.snapshot.load_state = LoadState::Stopped,
        }
    }
}

impl Drop for HttpTab {
    fn drop(&mut self) {
        if let Some(task) = self.lock().task.take() {
            task.abort();
        }
    }
}
