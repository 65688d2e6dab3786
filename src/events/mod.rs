//! Debounced publish/subscribe backbone.
//!
//! One broadcast channel per bus; every handler owns a dispatch task that
//! filters the stream by [`EventKind`]. A handler id has at most one live
//! dispatch task at a time.

pub mod types;

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

pub use types::{EventFilter, EventKey, EventKind, ShellEvent};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);
const CHANNEL_CAPACITY: usize = 256;

pub struct EventBus {
    tx: broadcast::Sender<ShellEvent>,
    window: Duration,
    /// In-flight guards: key -> time of the accepted publish.
    in_flight: Arc<StdMutex<HashMap<EventKey, Instant>>>,
    handlers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_DEBOUNCE)
    }

    pub fn with_window(window: Duration) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            window,
            in_flight: Arc::new(StdMutex::new(HashMap::new())),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Publish without blocking. Returns `false` when the same logical event
    /// was already accepted within the debounce window.
    pub fn publish(&self, event: ShellEvent) -> bool {
        let key = EventKey::of(&event);
        let now = Instant::now();

        {
            let mut guards = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            // Lazy GC of released-but-not-yet-removed guards.
            guards.retain(|_, at| now.duration_since(*at) < self.window);
            if guards.contains_key(&key) {
                debug!(kind = ?key.kind, "event debounced");
                return false;
            }
            guards.insert(key, now);
        }

        self.schedule_release(key, now);

        match self.tx.send(event) {
            Ok(receivers) => debug!(kind = ?key.kind, receivers, "event published"),
            Err(_) => debug!(kind = ?key.kind, "event published with no subscribers"),
        }
        true
    }

    fn schedule_release(&self, key: EventKey, stamp: Instant) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // No runtime: the guard expires through lazy GC on the next publish.
            return;
        };
        let guards = Arc::clone(&self.in_flight);
        let window = self.window;
        handle.spawn(async move {
            tokio::time::sleep_until(stamp + window).await;
            let mut guards = guards.lock().unwrap_or_else(|e| e.into_inner());
            if guards.get(&key) == Some(&stamp) {
                guards.remove(&key);
            }
        });
    }

    /// Install the single listener for `handler_id`, cancelling any listener
    /// previously registered under the same id. The old dispatch task has
    /// fully stopped before the new one subscribes.
    pub async fn register_handler<F, Fut>(&self, handler_id: &str, filter: EventFilter, callback: F)
    where
        F: Fn(ShellEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut handlers = self.handlers.lock().await;

        if let Some(old) = handlers.remove(handler_id) {
            old.abort();
            let _ = old.await;
            debug!(handler_id, "previous handler cancelled");
        }

        let mut rx = self.tx.subscribe();
        let id = handler_id.to_string();
        let task = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(handler_id = %id, skipped, "handler lagged behind event stream");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !filter.matches(event.kind()) {
                    continue;
                }
                let kind = event.kind();
                // The callback itself may panic before handing back a future.
                let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                    Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                    Err(panic) => Err(panic),
                };
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(handler_id = %id, ?kind, "handler failed: {:#}", e),
                    Err(_) => error!(handler_id = %id, ?kind, "handler panicked"),
                }
            }
            debug!(handler_id = %id, "handler stream closed");
        });

        handlers.insert(handler_id.to_string(), task);
        debug!(handler_id, count = handlers.len(), "handler registered");
    }

    /// Cancel and remove the listener for `handler_id`. Returns whether one
    /// was registered.
    pub async fn unregister_handler(&self, handler_id: &str) -> bool {
        let mut handlers = self.handlers.lock().await;
        match handlers.remove(handler_id) {
            Some(task) => {
                task.abort();
                let _ = task.await;
                debug!(handler_id, "handler unregistered");
                true
            }
            None => false,
        }
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.lock().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
