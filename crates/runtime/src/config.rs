use std::str::FromStr;
use std::time::Duration;

/// Tunables shared by every controller. `from_env` reads the `KORDA_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub workers: usize,
    pub drain_timeout: Duration,
    /// Zero disables the periodic relist.
    pub resync: Duration,
    pub start_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub allow_crd_deletion: bool,
    pub max_yaml_bytes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            drain_timeout: Duration::from_secs(30),
            resync: Duration::from_secs(600),
            start_timeout: Duration::from_secs(60),
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(120),
            allow_crd_deletion: false,
            max_yaml_bytes: 1024 * 1024,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_or("KORDA_WORKERS", d.workers).max(1),
            drain_timeout: Duration::from_secs(env_or("KORDA_DRAIN_TIMEOUT_SECS", d.drain_timeout.as_secs())),
            resync: Duration::from_secs(env_or("KORDA_RESYNC_SECS", d.resync.as_secs())),
            start_timeout: Duration::from_secs(env_or("KORDA_START_TIMEOUT_SECS", d.start_timeout.as_secs())),
            backoff_base: Duration::from_millis(env_or("KORDA_BACKOFF_BASE_MS", d.backoff_base.as_millis() as u64)),
            backoff_max: Duration::from_secs(env_or("KORDA_BACKOFF_MAX_SECS", d.backoff_max.as_secs())),
            allow_crd_deletion: env_flag("KORDA_ALLOW_CRD_DELETION", d.allow_crd_deletion),
            max_yaml_bytes: env_or("KORDA_MAX_YAML_BYTES", d.max_yaml_bytes),
        }
    }
}

pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

pub fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
        .unwrap_or(default)
}
