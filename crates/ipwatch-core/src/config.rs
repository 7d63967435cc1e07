//! Configuration and data directory management.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Paths to ipwatch data directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// SQLite database directory (`data/db/`).
    pub db: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates directories if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let paths = Self {
            db: root.join("db"),
            root,
        };
        std::fs::create_dir_all(&paths.db)?;
        Ok(paths)
    }
}

/// Cache layer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Redis connection URL. `None` runs on the memory backend only.
    pub redis_url: Option<String>,
    /// Time-to-live for read-plane entries.
    pub ttl: Duration,
    /// Capacity of the in-process fallback.
    pub max_entries: usize,
    /// Minimum delay between reconnection probes while degraded.
    pub probe_interval: Duration,
    /// Prefix for every Redis key.
    pub key_prefix: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            ttl: Duration::from_secs(300),
            max_entries: 1000,
            probe_interval: Duration::from_secs(30),
            key_prefix: "ipwatch".to_string(),
        }
    }
}

/// Record lifetime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionSettings {
    /// How long an ingested indicator stays active.
    pub record_ttl: Duration,
    /// How long expired indicators are kept for audit before the sweep removes them.
    pub grace_period: Duration,
    /// Period of the background expire sweep.
    pub sweep_interval: Duration,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            record_ttl: Duration::from_secs(90 * 24 * 3600),
            grace_period: Duration::from_secs(7 * 24 * 3600),
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSettings {
    /// Period between scheduled collections of a source.
    pub interval: Duration,
    /// Consecutive failures after which a source is disabled automatically.
    pub auto_disable_after: u32,
    /// Cooldown after the first failure; doubles per further failure.
    pub backoff_base: Duration,
    /// Upper bound for the cooldown.
    pub backoff_max: Duration,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(24 * 3600),
            auto_disable_after: 5,
            backoff_base: Duration::from_secs(60),
            backoff_max: Duration::from_secs(3600),
        }
    }
}

/// Externally supplied settings for one collector.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source name; also selects the collector variant.
    pub name: String,
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
    /// Initial `enabled` flag for a source seen for the first time.
    pub enabled: bool,
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Top-level ipwatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpwatchConfig {
    pub data_paths: DataPaths,
    pub cache: CacheSettings,
    pub retention: RetentionSettings,
    pub collection: CollectionSettings,
    pub sources: Vec<SourceConfig>,
}

const DEFAULT_SOURCES: &[(&str, &str)] = &[
    ("regtech", "https://regtech.fsec.or.kr"),
    ("secudium", "https://secudium.skinfosec.co.kr"),
];

impl IpwatchConfig {
    /// Configuration with built-in defaults and no sources.
    pub fn with_defaults(data_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self {
            data_paths: DataPaths::new(data_dir)?,
            cache: CacheSettings::default(),
            retention: RetentionSettings::default(),
            collection: CollectionSettings::default(),
            sources: Vec::new(),
        })
    }

    /// Create configuration from environment and defaults.
    pub fn from_env(data_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let mut config = Self::with_defaults(data_dir)?;

        config.cache.redis_url = std::env::var("IPWATCH_REDIS_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());
        config.cache.ttl = env_secs("IPWATCH_CACHE_TTL_SECS", config.cache.ttl);
        config.cache.max_entries = env_u64("IPWATCH_CACHE_MAX_ENTRIES")
            .map(|n| n as usize)
            .unwrap_or(config.cache.max_entries);

        config.retention.record_ttl = env_u64("IPWATCH_RECORD_TTL_HOURS")
            .map(hours)
            .unwrap_or(config.retention.record_ttl);
        config.retention.grace_period = env_u64("IPWATCH_GRACE_HOURS")
            .map(hours)
            .unwrap_or(config.retention.grace_period);
        config.retention.sweep_interval =
            env_secs("IPWATCH_SWEEP_INTERVAL_SECS", config.retention.sweep_interval);

        config.collection.interval =
            env_secs("IPWATCH_COLLECT_INTERVAL_SECS", config.collection.interval);
        config.collection.auto_disable_after = env_u64("IPWATCH_AUTO_DISABLE_AFTER")
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .unwrap_or(config.collection.auto_disable_after);
        config.collection.backoff_base =
            env_secs("IPWATCH_BACKOFF_BASE_SECS", config.collection.backoff_base);
        config.collection.backoff_max =
            env_secs("IPWATCH_BACKOFF_MAX_SECS", config.collection.backoff_max);

        let names = std::env::var("IPWATCH_SOURCES").unwrap_or_else(|_| {
            DEFAULT_SOURCES
                .iter()
                .map(|(name, _)| *name)
                .collect::<Vec<_>>()
                .join(",")
        });
        for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            config.sources.push(source_from_env(name));
        }

        Ok(config)
    }

    /// Look up a configured source by name.
    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }
}

fn source_from_env(name: &str) -> SourceConfig {
    let prefix = format!("IPWATCH_{}", name.to_uppercase());
    let default_url = DEFAULT_SOURCES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, url)| url.to_string())
        .unwrap_or_default();

    SourceConfig {
        name: name.to_string(),
        base_url: std::env::var(format!("{}_BASE_URL", prefix)).unwrap_or(default_url),
        username: std::env::var(format!("{}_USERNAME", prefix)).unwrap_or_default(),
        password: std::env::var(format!("{}_PASSWORD", prefix)).unwrap_or_default(),
        timeout: env_secs(&format!("{}_TIMEOUT_SECS", prefix), Duration::from_secs(30)),
        enabled: std::env::var(format!("{}_ENABLED", prefix))
            .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(true),
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Whole hours, saturating instead of overflowing on absurd values.
fn hours(h: u64) -> Duration {
    Duration::from_secs(h.saturating_mul(3600))
}

fn env_secs(name: &str, default: Duration) -> Duration {
    env_u64(name).map(Duration::from_secs).unwrap_or(default)
}
