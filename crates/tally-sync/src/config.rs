//! # Engine Configuration
//!
//! Configuration management for the bus/cache/queue engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_MAX_RETRIES=5                                                │
//! │     TALLY_PROBE_ADDR=api.example.com:443                               │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tally/tally.toml (Linux)                                 │
//! │     ~/Library/Application Support/com.tally.app/tally.toml (macOS)    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     5 minute cache TTL, 3 retries, offline until told otherwise        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # tally.toml
//! [cache]
//! default_ttl_ms = 300000
//! sweep_interval_secs = 60
//!
//! [queue]
//! max_retries = 3
//! drain_interval_secs = 30
//! storage_key = "offline_sync_queue"
//!
//! [connectivity]
//! initially_online = false
//! probe_addr = "api.example.com:443"
//!
//! [storage]
//! database_path = "/var/lib/tally/tally.db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use tally_core::{DEFAULT_CACHE_TTL_MS, DEFAULT_MAX_RETRIES, QUEUE_STORAGE_KEY};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Cache Settings
// =============================================================================

/// TTL cache behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// TTL applied when `set` is called without one (milliseconds).
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,

    /// Upper bound on live entries. Unbounded when absent.
    #[serde(default)]
    pub max_entries: Option<usize>,

    /// Interval of the background expiry sweep (seconds).
    /// Set to 0 to rely on lazy expiration only.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_ttl_ms() -> u64 {
    DEFAULT_CACHE_TTL_MS
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            default_ttl_ms: default_ttl_ms(),
            max_entries: None,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl CacheSettings {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

// =============================================================================
// Queue Settings
// =============================================================================

/// Offline sync queue behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Attempts before an item is dropped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Interval of the periodic drain timer (seconds).
    /// Set to 0 to drain only on enqueue and reconnect.
    #[serde(default = "default_drain_interval")]
    pub drain_interval_secs: u64,

    /// Key the queue is persisted under.
    #[serde(default = "default_storage_key")]
    pub storage_key: String,

    /// Write attempts before a persistence failure is surfaced.
    #[serde(default = "default_persist_attempts")]
    pub persist_attempts: u32,

    /// Initial backoff between write attempts (milliseconds).
    #[serde(default = "default_persist_backoff")]
    pub persist_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_drain_interval() -> u64 {
    30
}
fn default_storage_key() -> String {
    QUEUE_STORAGE_KEY.to_string()
}
fn default_persist_attempts() -> u32 {
    3
}
fn default_persist_backoff() -> u64 {
    50
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            max_retries: default_max_retries(),
            drain_interval_secs: default_drain_interval(),
            storage_key: default_storage_key(),
            persist_attempts: default_persist_attempts(),
            persist_backoff_ms: default_persist_backoff(),
        }
    }
}

impl QueueSettings {
    /// Periodic drain interval, or `None` when disabled.
    pub fn drain_interval(&self) -> Option<Duration> {
        (self.drain_interval_secs > 0).then(|| Duration::from_secs(self.drain_interval_secs))
    }

    pub fn persist_backoff(&self) -> Duration {
        Duration::from_millis(self.persist_backoff_ms)
    }
}

// =============================================================================
// Connectivity Settings
// =============================================================================

/// Reachability detection.
///
/// Without a `probe_addr` the host application is expected to push
/// reachability changes itself (see `ManualReachability`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivitySettings {
    /// State assumed before the first reachability signal.
    #[serde(default)]
    pub initially_online: bool,

    /// `host:port` probed over TCP.
    #[serde(default)]
    pub probe_addr: Option<String>,

    /// Seconds between probes.
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// Connect timeout per probe (milliseconds).
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

fn default_probe_interval() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    2_000
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        ConnectivitySettings {
            initially_online: false,
            probe_addr: None,
            probe_interval_secs: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

impl ConnectivitySettings {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

/// Durable storage location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite database file. Defaults to the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl StorageSettings {
    /// Resolves the database path, falling back to the platform data dir.
    pub fn resolve_database_path(&self) -> SyncResult<PathBuf> {
        if let Some(ref path) = self.database_path {
            return Ok(path.clone());
        }

        directories::ProjectDirs::from("com", "tally", "app")
            .map(|dirs| dirs.data_dir().join("tally.db"))
            .ok_or_else(|| {
                SyncError::InvalidConfig("No database path configured and no data directory".into())
            })
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub connectivity: ConnectivitySettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (tally.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.cache.default_ttl_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "cache.default_ttl_ms must be greater than 0".into(),
            ));
        }

        if self.cache.max_entries == Some(0) {
            return Err(SyncError::InvalidConfig(
                "cache.max_entries must be greater than 0 when set".into(),
            ));
        }

        if self.queue.max_retries == 0 {
            return Err(SyncError::InvalidConfig(
                "queue.max_retries must be at least 1".into(),
            ));
        }

        if self.queue.persist_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "queue.persist_attempts must be at least 1".into(),
            ));
        }

        if self.queue.storage_key.trim().is_empty() {
            return Err(SyncError::InvalidConfig(
                "queue.storage_key must not be empty".into(),
            ));
        }

        if let Some(ref addr) = self.connectivity.probe_addr {
            let valid = addr
                .rsplit_once(':')
                .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                .unwrap_or(false);
            if !valid {
                return Err(SyncError::InvalidConfig(format!(
                    "connectivity.probe_addr must be host:port, got: {}",
                    addr
                )));
            }

            if self.connectivity.probe_interval_secs == 0 || self.connectivity.probe_timeout_ms == 0
            {
                return Err(SyncError::InvalidConfig(
                    "probe interval and timeout must be greater than 0".into(),
                ));
            }
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(ttl) = std::env::var("TALLY_CACHE_TTL_MS") {
            match ttl.parse::<u64>() {
                Ok(ms) => self.cache.default_ttl_ms = ms,
                Err(_) => warn!(value = %ttl, "Ignoring invalid TALLY_CACHE_TTL_MS"),
            }
        }

        if let Ok(retries) = std::env::var("TALLY_MAX_RETRIES") {
            if let Ok(n) = retries.parse::<u32>() {
                debug!(max_retries = n, "Overriding max retries from environment");
                self.queue.max_retries = n;
            }
        }

        if let Ok(interval) = std::env::var("TALLY_DRAIN_INTERVAL_SECS") {
            if let Ok(secs) = interval.parse::<u64>() {
                self.queue.drain_interval_secs = secs;
            }
        }

        if let Ok(addr) = std::env::var("TALLY_PROBE_ADDR") {
            debug!(addr = %addr, "Overriding probe address from environment");
            self.connectivity.probe_addr = Some(addr);
        }

        if let Ok(online) = std::env::var("TALLY_START_ONLINE") {
            match online.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.connectivity.initially_online = true,
                "0" | "false" | "no" => self.connectivity.initially_online = false,
                _ => warn!(value = %online, "Unknown TALLY_START_ONLINE value"),
            }
        }

        if let Ok(path) = std::env::var("TALLY_DB_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "app")
            .map(|dirs| dirs.config_dir().join("tally.toml"))
    }
}
