//! Seams to the browser engine: what the core reads from a tab and how it
//! drives one.

pub mod http;

use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LoadState {
    Initializing,
    /// Progress in percent.
    Loading(u8),
    Finished,
    /// The engine gave up on the load (stopped, crashed).
    Stopped,
}

/// A navigation error reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavError {
    pub code: i32,
    pub description: String,
    pub main_frame: bool,
}

impl NavError {
    pub fn main_frame(code: i32, description: &str) -> Self {
        Self {
            code,
            description: description.to_string(),
            main_frame: true,
        }
    }
}

/// Point-in-time view of a tab.
#[derive(Debug, Clone, PartialEq)]
pub struct TabSnapshot {
    pub url: Option<String>,
    pub load_state: LoadState,
    pub errors: Vec<NavError>,
}

impl TabSnapshot {
    pub fn initializing() -> Self {
        Self {
            url: None,
            load_state: LoadState::Initializing,
            errors: Vec::new(),
        }
    }
}

pub trait TabState: Send + Sync {
    /// Last snapshot pulled from the engine, without touching it.
    fn cached(&self) -> TabSnapshot;

    /// Pull the live state from the engine.
    fn refresh(&self) -> BoxFuture<'_, TabSnapshot>;
}

pub trait Navigator: Send + Sync {
    fn reload(&self);
    fn stop_loading(&self);
    fn load_url(&self, url: &str);
}

/// A tab the core can both observe and drive.
pub trait BrowsingContext: TabState + Navigator {}

impl<T: TabState + Navigator> BrowsingContext for T {}

/// Opens a new browsing context at a URL.
pub trait TabOpener: Send + Sync {
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Arc<dyn BrowsingContext>>>;
}
