use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Settings for the HTTP surface of the proxy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxySettings {
    pub port: u16,
    /// TLS is enabled iff both `cert_file` and `key_file` are set.
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Directory holding `usage.db`.
    pub db_dir: PathBuf,
    /// Upstream registry, e.g. `127.0.0.1:5000`.
    pub registry_host: String,
    pub registry_scheme: String,
    /// Pass inbound `x-forwarded-*` headers through instead of stripping
    /// them.
    #[serde(default)]
    pub use_forwarded_headers: bool,
}

/// Settings consumed by the maintenance subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CleanSettings {
    /// Filesystem path whose usage is measured.
    pub registry_dir: PathBuf,
    /// Use the statfs fast path instead of walking `registry_dir`. Only
    /// meaningful when the filesystem is dedicated to the registry, since
    /// statfs measures the whole mount.
    #[serde(default)]
    pub use_optimized_disk_calculation: bool,
    /// Clean cycles evict until usage drops to this many bytes.
    pub target_usage_bytes: u64,
    /// Fraction in [0, 1] of the current LRU list evicted per iteration.
    pub clean_tags_percentage: f64,
    pub cron_schedule: String,
    pub time_zone: String,
    /// Registry binary and config used for external garbage collection.
    pub registry_binary: PathBuf,
    pub registry_config: PathBuf,
}
