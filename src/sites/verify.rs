use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;

use crate::tab::{BrowsingContext, LoadState, NavError, TabSnapshot};

/// Retry and timing policy for one verification job.
#[derive(Debug, Clone)]
pub struct VerifyConfig {
    pub max_attempts: u32,
    /// Wait before each attempt.
    pub retry_delay: Duration,
    /// A still-loading tab that already shows a valid URL is accepted after this.
    pub slow_accept_after: Duration,
    /// A still-loading tab without a URL fails the attempt after this.
    pub attempt_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
            slow_accept_after: Duration::from_secs(8),
            attempt_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Accepted { attempts: u32 },
    Rejected { attempts: u32 },
}

/// Network-level failures that mean the main page did not load.
const CRITICAL_ERRORS: &[(i32, &str)] = &[
    (-105, "ERR_NAME_NOT_RESOLVED"),
    (-137, "ERR_NAME_RESOLUTION_FAILED"),
    (-102, "ERR_CONNECTION_REFUSED"),
    (-101, "ERR_CONNECTION_RESET"),
    (-118, "ERR_CONNECTION_TIMED_OUT"),
    (-106, "ERR_INTERNET_DISCONNECTED"),
    (-21, "ERR_NETWORK_CHANGED"),
];

/// Sub-request failures caused by content blocking; never fatal.
const RESOURCE_BLOCKING_ERRORS: &[(i32, &str)] = &[
    (-3, "ERR_ABORTED"),
    (-20, "ERR_BLOCKED_BY_CLIENT"),
    (-22, "ERR_BLOCKED_BY_ADMINISTRATOR"),
    (-27, "ERR_BLOCKED_BY_RESPONSE"),
];

fn in_table(err: &NavError, table: &[(i32, &str)]) -> bool {
    let description = err.description.to_ascii_uppercase();
    table
        .iter()
        .any(|(code, name)| err.code == *code || description.contains(name))
}

pub fn is_critical_error(err: &NavError) -> bool {
    err.main_frame
        && !in_table(err, RESOURCE_BLOCKING_ERRORS)
        && in_table(err, CRITICAL_ERRORS)
}

/// Heuristic for servers that answer with an error page instead of the site.
pub fn is_error_page(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    if ["/404", "/error", "/not-found"]
        .iter()
        .any(|marker| path.contains(marker))
    {
        return true;
    }
    url.query_pairs().any(|(key, _)| {
        key.eq_ignore_ascii_case("error") || key.eq_ignore_ascii_case("errorcode")
    })
}

fn well_formed(url: Option<&str>) -> Option<Url> {
    let url = Url::parse(url?).ok()?;
    if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() {
        Some(url)
    } else {
        None
    }
}

/// Why a finished load was not accepted, if it was not.
pub fn judge_finished(snapshot: &TabSnapshot) -> Result<(), String> {
    if let Some(err) = snapshot.errors.iter().find(|e| is_critical_error(e)) {
        return Err(format!("network error {} ({})", err.code, err.description));
    }
    let Some(url) = well_formed(snapshot.url.as_deref()) else {
        return Err("no valid URL".to_string());
    };
    if is_error_page(&url) {
        return Err(format!("error page {}", url));
    }
    Ok(())
}

/// Drive `tab` until it is accepted or `max_attempts` attempts have failed.
pub async fn verify_tab(site_id: &str, tab: &dyn BrowsingContext, config: &VerifyConfig) -> VerifyOutcome {
    let mut attempts = 0;

    while attempts < config.max_attempts {
        tokio::time::sleep(config.retry_delay).await;
        attempts += 1;
        let started = Instant::now();

        let failure = loop {
            let snapshot = tab.refresh().await;
            match snapshot.load_state {
                LoadState::Finished => match judge_finished(&snapshot) {
                    Ok(()) => {
                        info!(site_id, attempts, url = ?snapshot.url, "Site verified");
                        return VerifyOutcome::Accepted { attempts };
                    }
                    Err(reason) => break reason,
                },
                LoadState::Initializing | LoadState::Loading(_) => {
                    let elapsed = started.elapsed();
                    if elapsed > config.slow_accept_after
                        && well_formed(snapshot.url.as_deref()).is_some()
                    {
                        info!(site_id, attempts, url = ?snapshot.url, "Slow site accepted while loading");
                        return VerifyOutcome::Accepted { attempts };
                    }
                    if elapsed >= config.attempt_timeout {
                        break "load timed out".to_string();
                    }
                    tokio::time::sleep(config.poll_interval).await;
                }
                other => break format!("unexpected load state {:?}", other),
            }
        };

        info!(site_id, attempts, max = config.max_attempts, reason = %failure, "Verification attempt failed");
        if attempts < config.max_attempts {
            debug!(site_id, "reloading");
            tab.reload();
        }
    }

    VerifyOutcome::Rejected { attempts }
}
