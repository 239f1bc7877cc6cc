//! # Service Configuration
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     SCALES_DATABASE_PATH=/var/lib/scales/scales.db                     │
//! │     SCALES_LINK_REQUEST_TIMEOUT_MS=8000                                │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/scale-sync/scales.toml (Linux)                           │
//! │     ~/Library/Application Support/com.scales.scale-sync/scales.toml    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! log_level = "info"
//!
//! [link]
//! connect_timeout_ms = 3000
//! request_timeout_ms = 5000
//!
//! [cache]
//! require_existing_plu = false
//! diagnose_on_reject = false
//!
//! [auto_update]
//! default_interval_secs = 3600
//! lock_wait_ms = 30000
//! initial_retry_secs = 30
//! backoff_cap_secs = 900
//! relabel_dates = true
//!
//! [database]
//! path = "/var/lib/scales/scales.db"
//!
//! [[devices]]
//! id = 1
//! name = "Deli counter"
//! address = "192.168.1.50"
//! port = 1111
//! transport = "tcp"
//! auto_update = { enabled = true, interval_secs = 1800 }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use scale_core::{AutoUpdateConfig, DeviceId};

use crate::error::{SyncError, SyncResult};
use crate::link::{DeviceDescriptor, Transport};

// =============================================================================
// Link Settings
// =============================================================================

/// Deadlines applied to every device link call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    /// Deadline for opening a session (milliseconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Deadline for a single fetch or push (milliseconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_connect_timeout() -> u64 {
    3000
}

fn default_request_timeout() -> u64 {
    5000
}

impl Default for LinkSettings {
    fn default() -> Self {
        LinkSettings {
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl LinkSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// =============================================================================
// Cache Settings
// =============================================================================

/// Product cache behaviour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSettings {
    /// When true, patching a PLU the cache does not hold fails with
    /// `ProductNotFound` instead of creating the product.
    #[serde(default)]
    pub require_existing_plu: bool,

    /// When true, an upload of staged edits the device refuses is followed
    /// by a diagnosis of the whole cached table. Off by default: the
    /// diagnosis keeps the device busy for many uploads.
    #[serde(default)]
    pub diagnose_on_reject: bool,
}

// =============================================================================
// Auto-Update Settings
// =============================================================================

/// Scheduler-wide settings; per-device interval lives on the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoUpdateSettings {
    /// Master switch. When off, schedules are recorded but no timer runs.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval used for devices declared without one (seconds).
    #[serde(default = "default_interval")]
    pub default_interval_secs: u64,

    /// How long a tick waits for a busy device before skipping (milliseconds).
    #[serde(default = "default_lock_wait")]
    pub lock_wait_ms: u64,

    /// First retry delay after a failed run (seconds).
    #[serde(default = "default_initial_retry")]
    pub initial_retry_secs: u64,

    /// Upper bound on the retry delay (seconds). The effective cap is also
    /// never above the device's own interval.
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,

    /// Refresh manufacture / sell-by dates and push them after each
    /// scheduled fetch.
    #[serde(default)]
    pub relabel_dates: bool,
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u64 {
    3600
}

fn default_lock_wait() -> u64 {
    30_000
}

fn default_initial_retry() -> u64 {
    30
}

fn default_backoff_cap() -> u64 {
    900
}

impl Default for AutoUpdateSettings {
    fn default() -> Self {
        AutoUpdateSettings {
            enabled: true,
            default_interval_secs: default_interval(),
            lock_wait_ms: default_lock_wait(),
            initial_retry_secs: default_initial_retry(),
            backoff_cap_secs: default_backoff_cap(),
            relabel_dates: false,
        }
    }
}

impl AutoUpdateSettings {
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn initial_retry(&self) -> Duration {
        Duration::from_secs(self.initial_retry_secs)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }
}

// =============================================================================
// Database Settings
// =============================================================================

/// Durable storage. Without a path, caches live in memory only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// =============================================================================
// Device Entries
// =============================================================================

/// A scale declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: i64,

    #[serde(default)]
    pub name: String,

    pub address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: Transport,

    #[serde(default)]
    pub auto_update: Option<AutoUpdateConfig>,
}

fn default_port() -> u16 {
    1111
}

impl DeviceEntry {
    pub fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            id: DeviceId(self.id),
            name: self.name.clone(),
            address: self.address.clone(),
            port: self.port,
            transport: self.transport,
        }
    }

    /// The device's schedule, falling back to a disabled schedule with the
    /// service default interval.
    pub fn auto_update_config(&self, defaults: &AutoUpdateSettings) -> AutoUpdateConfig {
        self.auto_update.unwrap_or(AutoUpdateConfig {
            enabled: false,
            interval_secs: defaults.default_interval_secs,
        })
    }
}

// =============================================================================
// Main Service Configuration
// =============================================================================

/// Complete service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub link: LinkSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub auto_update: AutoUpdateSettings,

    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            log_level: default_log_level(),
            link: LinkSettings::default(),
            cache: CacheSettings::default(),
            auto_update: AutoUpdateSettings::default(),
            database: DatabaseSettings::default(),
            devices: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (scales.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = Self::from_toml(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Parses a TOML document without applying environment overrides.
    pub fn from_toml(contents: &str) -> SyncResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.link.connect_timeout_ms == 0 || self.link.request_timeout_ms == 0 {
            return Err(SyncError::Config("link timeouts must be greater than 0".into()));
        }

        let au = &self.auto_update;
        if au.default_interval_secs == 0 {
            return Err(SyncError::Config(
                "auto_update.default_interval_secs must be greater than 0".into(),
            ));
        }
        if au.initial_retry_secs == 0 || au.backoff_cap_secs == 0 {
            return Err(SyncError::Config(
                "auto_update retry delays must be greater than 0".into(),
            ));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id) {
                return Err(SyncError::Config(format!("device id {} declared twice", device.id)));
            }
            if let Some(schedule) = &device.auto_update {
                schedule.validate().map_err(|e| {
                    SyncError::Config(format!("device {}: {}", device.id, e))
                })?;
            }
        }

        Ok(())
    }

    /// Applies `SCALES_*` overrides read through `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(level) = lookup("SCALES_LOG_LEVEL") {
            self.log_level = level;
        }

        if let Some(path) = lookup("SCALES_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = Some(PathBuf::from(path));
        }

        override_parsed(&lookup, "SCALES_LINK_CONNECT_TIMEOUT_MS", &mut self.link.connect_timeout_ms);
        override_parsed(&lookup, "SCALES_LINK_REQUEST_TIMEOUT_MS", &mut self.link.request_timeout_ms);
        override_parsed(&lookup, "SCALES_REQUIRE_EXISTING_PLU", &mut self.cache.require_existing_plu);
        override_parsed(&lookup, "SCALES_DIAGNOSE_ON_REJECT", &mut self.cache.diagnose_on_reject);
        override_parsed(&lookup, "SCALES_AUTO_UPDATE_ENABLED", &mut self.auto_update.enabled);
        override_parsed(&lookup, "SCALES_AUTO_UPDATE_LOCK_WAIT_MS", &mut self.auto_update.lock_wait_ms);
        override_parsed(&lookup, "SCALES_AUTO_UPDATE_BACKOFF_CAP_SECS", &mut self.auto_update.backoff_cap_secs);
        override_parsed(&lookup, "SCALES_RELABEL_DATES", &mut self.auto_update.relabel_dates);
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "scales", "scale-sync")
            .map(|dirs| dirs.config_dir().join("scales.toml"))
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => warn!(key, value = %raw, "Ignoring unparsable environment override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.link.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.auto_update.default_interval_secs, 3600);
        assert!(!config.cache.require_existing_plu);
        assert!(!config.cache.diagnose_on_reject);
        assert!(config.database.path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let config = ServiceConfig::from_toml(
            r#"
            log_level = "debug"

            [cache]
            diagnose_on_reject = true

            [auto_update]
            lock_wait_ms = 100
            relabel_dates = true

            [[devices]]
            id = 7
            name = "Deli"
            address = "10.0.0.7"
            auto_update = { enabled = true, interval_secs = 600 }

            [[devices]]
            id = 8
            address = "10.0.0.8"
            transport = "file"
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level, "debug");
        assert!(config.cache.diagnose_on_reject);
        assert!(!config.cache.require_existing_plu);
        assert_eq!(config.auto_update.lock_wait(), Duration::from_millis(100));
        assert!(config.auto_update.relabel_dates);
        assert_eq!(config.auto_update.backoff_cap_secs, 900);

        let deli = &config.devices[0];
        assert_eq!(deli.port, 1111);
        assert_eq!(deli.transport, Transport::Tcp);
        assert_eq!(
            deli.auto_update_config(&config.auto_update),
            AutoUpdateConfig::new(true, Duration::from_secs(600))
        );

        let other = &config.devices[1];
        assert_eq!(other.transport, Transport::File);
        assert!(!other.auto_update_config(&config.auto_update).enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SCALES_DATABASE_PATH", "/tmp/s.db"),
            ("SCALES_LINK_REQUEST_TIMEOUT_MS", "9000"),
            ("SCALES_RELABEL_DATES", "true"),
            ("SCALES_DIAGNOSE_ON_REJECT", "true"),
            ("SCALES_AUTO_UPDATE_LOCK_WAIT_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = ServiceConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.database.path, Some(PathBuf::from("/tmp/s.db")));
        assert_eq!(config.link.request_timeout_ms, 9000);
        assert!(config.auto_update.relabel_dates);
        assert!(config.cache.diagnose_on_reject);
        assert_eq!(config.auto_update.lock_wait_ms, 30_000);
    }

    #[test]
    fn test_config_validation() {
        let mut config = ServiceConfig::default();
        config.link.request_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let mut config = ServiceConfig::default();
        config.devices = ServiceConfig::from_toml(
            r#"
            [[devices]]
            id = 1
            address = "a"
            auto_update = { enabled = true, interval_secs = 0 }
            "#,
        )
        .unwrap()
        .devices;
        assert!(config.validate().is_err());

        let dup = ServiceConfig::from_toml(
            r#"
            [[devices]]
            id = 1
            address = "a"
            [[devices]]
            id = 1
            address = "b"
            "#,
        )
        .unwrap();
        assert!(dup.validate().is_err());
    }
}
