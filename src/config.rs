use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::access::AccessLists;
use crate::events::DEFAULT_DEBOUNCE;
use crate::sites::types::StaticSite;
use crate::sites::verify::VerifyConfig;

/// Runtime configuration, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub data_dir: PathBuf,
    pub static_sites: Vec<StaticSite>,
    pub block_list: Vec<String>,
    pub allow_patterns: Vec<String>,
    pub user_patterns: Vec<String>,
    pub excluded_hosts: Vec<String>,
    pub verify: VerifyConfig,
    pub debounce: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            static_sites: Vec::new(),
            block_list: Vec::new(),
            allow_patterns: Vec::new(),
            user_patterns: Vec::new(),
            excluded_hosts: Vec::new(),
            verify: VerifyConfig::default(),
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

fn comma_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn pattern_list(value: &str) -> Vec<String> {
    value.split_whitespace().map(|s| s.to_string()).collect()
}

/// `label=host` pairs separated by commas.
fn static_site_list(value: &str) -> Vec<StaticSite> {
    comma_list(value)
        .into_iter()
        .filter_map(|pair| match pair.split_once('=') {
            Some((label, host)) if !label.trim().is_empty() && !host.trim().is_empty() => {
                Some(StaticSite {
                    label: label.trim().to_string(),
                    host: host.trim().to_string(),
                })
            }
            _ => {
                warn!(entry = %pair, "Ignoring malformed static site (expected label=host)");
                None
            }
        })
        .collect()
}

fn millis(name: &str, value: Option<String>, default: Duration) -> Duration {
    match value {
        None => default,
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                warn!(name, value = %raw, "Invalid duration, using default");
                default
            }
        },
    }
}

impl GateConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| dotenv::var(name).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let verify_defaults = VerifyConfig::default();

        let max_attempts = match lookup("GATE_VERIFY_ATTEMPTS") {
            None => verify_defaults.max_attempts,
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(n) if n > 0 => n,
                _ => {
                    warn!(value = %raw, "Invalid GATE_VERIFY_ATTEMPTS, using default");
                    verify_defaults.max_attempts
                }
            },
        };

        Self {
            data_dir: lookup("GATE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            static_sites: lookup("GATE_STATIC_SITES")
                .map(|v| static_site_list(&v))
                .unwrap_or_default(),
            block_list: lookup("GATE_BLOCK_LIST")
                .map(|v| comma_list(&v))
                .unwrap_or_default(),
            allow_patterns: lookup("GATE_ALLOW_PATTERNS")
                .map(|v| pattern_list(&v))
                .unwrap_or_default(),
            user_patterns: lookup("GATE_USER_PATTERNS")
                .map(|v| pattern_list(&v))
                .unwrap_or_default(),
            excluded_hosts: lookup("GATE_EXCLUDED_HOSTS")
                .map(|v| comma_list(&v))
                .unwrap_or_default(),
            verify: VerifyConfig {
                max_attempts,
                retry_delay: millis(
                    "GATE_VERIFY_DELAY_MS",
                    lookup("GATE_VERIFY_DELAY_MS"),
                    verify_defaults.retry_delay,
                ),
                slow_accept_after: millis(
                    "GATE_SLOW_ACCEPT_MS",
                    lookup("GATE_SLOW_ACCEPT_MS"),
                    verify_defaults.slow_accept_after,
                ),
                attempt_timeout: millis(
                    "GATE_ATTEMPT_TIMEOUT_MS",
                    lookup("GATE_ATTEMPT_TIMEOUT_MS"),
                    verify_defaults.attempt_timeout,
                ),
                poll_interval: verify_defaults.poll_interval,
            },
            debounce: millis("GATE_DEBOUNCE_MS", lookup("GATE_DEBOUNCE_MS"), defaults.debounce),
        }
    }

    pub fn access_lists(&self) -> AccessLists {
        AccessLists::new(
            self.static_sites.clone(),
            self.block_list.clone(),
            self.allow_patterns.clone(),
            self.excluded_hosts.clone(),
        )
    }
}
