//! Engine configuration.
//!
//! Loaded from `~/.dlquota/config.toml` (or an explicit path), then overlaid
//! with `DLQUOTA_*` environment variables. A `.env` file in the working
//! directory is honoured. Every field has a default, so an empty file or no
//! file at all yields a working configuration.

pub mod watcher;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{QuotaError, Result};
use crate::quota::manager::ManagerSettings;
use crate::quota::service::ServiceSettings;
use crate::quota::DefaultDownloadQuotaLimits;

pub use watcher::ConfigWatcher;

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "DLQUOTA_";

// ============================================================================
// Sections
// ============================================================================

/// Denial notification settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    pub flush_tick_secs: u64,
    /// Messages kept per user between flushes.
    pub threshold: usize,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            flush_tick_secs: 60,
            threshold: 3,
        }
    }
}

/// Local cache bounds (applied to both the diff cache and the limits cache).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Idle time after which an entry is dropped.
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30 * 60,
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ============================================================================
// Config
// ============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Reconciliation period. Rate rows expire one period after they were written.
    pub sync_tick_secs: u64,
    /// Expired-rate purge period.
    pub rate_expiration_tick_secs: u64,
    /// Metrics summary period.
    pub metrics_tick_secs: u64,
    /// Tenants served by this instance.
    pub tenants: Vec<String>,
    /// Defaults for tenants without an entry in `tenant_defaults`.
    pub defaults: DefaultDownloadQuotaLimits,
    pub tenant_defaults: HashMap<String, DefaultDownloadQuotaLimits>,
    pub reporter: ReporterConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_tick_secs: 30,
            rate_expiration_tick_secs: 120,
            metrics_tick_secs: 60,
            tenants: Vec::new(),
            defaults: DefaultDownloadQuotaLimits::default(),
            tenant_defaults: HashMap::new(),
            reporter: ReporterConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// `~/.dlquota`
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dlquota")
    }

    /// `~/.dlquota/config.toml`
    pub fn path() -> PathBuf {
        Self::dir().join("config.toml")
    }

    /// Load from the default path, falling back to defaults when the file
    /// does not exist.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let path = Self::path();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            let mut config = Self::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load, overlay environment overrides and validate.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| QuotaError::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config = Self::from_toml(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without environment overrides or validation.
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| QuotaError::Config(format!("invalid TOML: {e}")))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| QuotaError::Config(e.to_string()))
    }

    /// Overlay `DLQUOTA_*` process environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Overlay overrides looked up by variable name. Unparseable values are ignored.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));
        let num = |suffix: &str| var(suffix).and_then(|v| v.trim().parse::<u64>().ok());
        let int = |suffix: &str| var(suffix).and_then(|v| v.trim().parse::<i64>().ok());

        if let Some(v) = num("SYNC_TICK_SECS") {
            self.sync_tick_secs = v;
        }
        if let Some(v) = num("RATE_EXPIRATION_TICK_SECS") {
            self.rate_expiration_tick_secs = v;
        }
        if let Some(v) = num("METRICS_TICK_SECS") {
            self.metrics_tick_secs = v;
        }
        if let Some(v) = num("REPORTER_FLUSH_TICK_SECS") {
            self.reporter.flush_tick_secs = v;
        }
        if let Some(v) = num("REPORTER_THRESHOLD") {
            self.reporter.threshold = v as usize;
        }
        if let Some(v) = num("CACHE_TTL_SECS") {
            self.cache.ttl_secs = v;
        }
        if let Some(v) = num("CACHE_MAX_ENTRIES") {
            self.cache.max_entries = v as usize;
        }
        if let Some(v) = int("DEFAULT_MAX_QUOTA") {
            self.defaults.max_quota = v;
        }
        if let Some(v) = int("DEFAULT_RATE_LIMIT") {
            self.defaults.rate_limit = v;
        }
        if let Some(v) = var("TENANTS") {
            self.tenants = v
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = var("LOG_JSON") {
            self.logging.json = matches!(v.trim(), "1" | "true" | "yes");
        }
    }

    pub fn validate(&self) -> Result<()> {
        let ticks = [
            ("sync_tick_secs", self.sync_tick_secs),
            ("rate_expiration_tick_secs", self.rate_expiration_tick_secs),
            ("metrics_tick_secs", self.metrics_tick_secs),
            ("reporter.flush_tick_secs", self.reporter.flush_tick_secs),
            ("cache.ttl_secs", self.cache.ttl_secs),
        ];
        for (name, value) in ticks {
            if value == 0 {
                return Err(QuotaError::Config(format!("{name} must be greater than 0")));
            }
        }
        if self.reporter.threshold == 0 {
            return Err(QuotaError::Config(
                "reporter.threshold must be greater than 0".into(),
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(QuotaError::Config(
                "cache.max_entries must be greater than 0".into(),
            ));
        }
        if let Some(blank) = self.tenants.iter().find(|t| t.trim().is_empty()) {
            return Err(QuotaError::Config(format!("invalid tenant name {blank:?}")));
        }
        Ok(())
    }

    /// Effective defaults of `tenant`.
    pub fn defaults_for(&self, tenant: &str) -> DefaultDownloadQuotaLimits {
        self.tenant_defaults
            .get(tenant)
            .copied()
            .unwrap_or(self.defaults)
    }

    pub fn sync_tick(&self) -> Duration {
        Duration::from_secs(self.sync_tick_secs)
    }

    pub fn rate_expiration_tick(&self) -> Duration {
        Duration::from_secs(self.rate_expiration_tick_secs)
    }

    pub fn metrics_tick(&self) -> Duration {
        Duration::from_secs(self.metrics_tick_secs)
    }

    pub fn reporter_flush_tick(&self) -> Duration {
        Duration::from_secs(self.reporter.flush_tick_secs)
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            sync_window: self.sync_tick(),
            cache_ttl: Duration::from_secs(self.cache.ttl_secs),
            cache_max_entries: self.cache.max_entries,
        }
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            defaults: self.defaults,
            tenant_defaults: self.tenant_defaults.clone(),
            limits_cache_ttl: Duration::from_secs(self.cache.ttl_secs),
            limits_cache_max_entries: self.cache.max_entries,
        }
    }
}
