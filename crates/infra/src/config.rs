//! Configuration loading and representation.
//!
//! Everything comes from environment variables with defaults. A value that
//! does not parse falls back to its default with a warning rather than
//! failing startup.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

const MAX_RECEIVE_BATCH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub bind_addr: String,
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub queue_name: String,
    pub visibility_timeout: Duration,
    pub wait_time: Duration,
    pub max_messages: usize,
    pub max_receives: u32,
    pub retry_backoff: Duration,
    /// Accepted worker bearer tokens. Empty accepts any non-empty bearer.
    pub worker_tokens: Vec<String>,
    pub drift_sensitive_hashing: bool,
    pub reconcile_after: Duration,
    pub reconcile_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            use_persistent_stores: false,
            database_url: None,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            queue_name: "lorekeeper-jobs".to_string(),
            visibility_timeout: Duration::from_secs(900),
            wait_time: Duration::from_secs(20),
            max_messages: 1,
            max_receives: 5,
            retry_backoff: Duration::from_secs(60),
            worker_tokens: Vec::new(),
            drift_sensitive_hashing: false,
            reconcile_after: Duration::from_secs(300),
            reconcile_interval: Duration::from_secs(60),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let max_messages: usize = parse_or(&get, "QUEUE_MAX_MESSAGES", defaults.max_messages);

        Self {
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            use_persistent_stores: parse_bool_or(
                &get,
                "USE_PERSISTENT_STORES",
                defaults.use_persistent_stores,
            ),
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL").unwrap_or(defaults.redis_url),
            queue_name: get("QUEUE_NAME").unwrap_or(defaults.queue_name),
            visibility_timeout: secs_or(
                &get,
                "QUEUE_VISIBILITY_TIMEOUT_SECS",
                defaults.visibility_timeout,
            ),
            wait_time: secs_or(&get, "QUEUE_WAIT_TIME_SECS", defaults.wait_time),
            max_messages: max_messages.clamp(1, MAX_RECEIVE_BATCH),
            max_receives: parse_or(&get, "QUEUE_MAX_RECEIVES", defaults.max_receives).max(1),
            retry_backoff: secs_or(&get, "CONSUMER_RETRY_BACKOFF_SECS", defaults.retry_backoff),
            worker_tokens: get("WORKER_TOKENS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            drift_sensitive_hashing: parse_bool_or(
                &get,
                "DRIFT_SENSITIVE_HASHING",
                defaults.drift_sensitive_hashing,
            ),
            reconcile_after: secs_or(&get, "RECONCILE_AFTER_SECS", defaults.reconcile_after),
            reconcile_interval: secs_or(
                &get,
                "RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval,
            ),
        }
    }
}

fn parse_or<T: FromStr + Copy + std::fmt::Debug>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match get(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key = %key, value = %raw, default = ?default, "invalid config value; using default");
            default
        }),
    }
}

fn secs_or(get: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    Duration::from_secs(parse_or(get, key, default.as_secs()))
}

fn parse_bool_or(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => default,
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        Some(v) => {
            warn!(key = %key, value = %v, default, "invalid boolean config value; using default");
            default
        }
    }
}
