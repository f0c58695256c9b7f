//! Configuration management for Heliograph
//!
//! This module handles loading, validation, and management of the engine
//! configuration from YAML files.

use crate::error::{HeliographError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_true() -> bool {
    true
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Remote forecast service configuration
    pub api: ApiConfig,

    /// Rooftop sites to fetch forecasts for
    pub sites: Vec<SiteConfig>,

    /// Refresh cycle behaviour
    pub refresh: RefreshConfig,

    /// On-disk cache locations
    pub storage: StorageConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Timezone for day-boundary operations (IANA name)
    pub timezone: String,

    /// Optional initial "all sites" dampening factors (24 hourly values),
    /// applied only when no dampening file exists yet
    #[serde(default)]
    pub dampening: Option<Vec<f64>>,
}

/// Remote forecast service parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the forecast service
    pub host: String,

    /// Per-request HTTP timeout in seconds
    pub request_timeout_secs: u64,
}

/// A single rooftop site
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Opaque site resource id assigned by the service
    pub resource_id: String,

    /// API key credential used for this site
    pub api_key: String,

    /// Optional display name
    #[serde(default)]
    pub name: Option<String>,

    /// Fetch and cache this site but leave it out of cross-site totals
    #[serde(default)]
    pub exclude_from_totals: bool,

    /// Daily API call allowance for this site's credential
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
}

fn default_daily_limit() -> u32 {
    10
}

/// Refresh cycle behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Whether the daemon drives automatic scheduled refreshes
    #[serde(default = "default_true")]
    pub auto_update: bool,

    /// Minutes between scheduled refresh cycles
    pub interval_minutes: u64,

    /// Minimum minutes between any two refresh cycle starts
    pub guard_minutes: u64,

    /// Overall per-site fetch timeout in seconds
    pub fetch_timeout_secs: u64,

    /// Fetch attempts per call before giving up
    pub attempts: u32,

    /// Cooldown in seconds when the service reports it is busy
    pub busy_cooldown_secs: u64,

    /// Base backoff in seconds for transient fetch failures
    pub transient_backoff_secs: u64,
}

/// On-disk cache locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding all persisted caches
    pub data_dir: String,
}

impl StorageConfig {
    /// Forecast cache file path
    pub fn forecast_cache_path(&self) -> std::path::PathBuf {
        Path::new(&self.data_dir).join("solcast.json")
    }

    /// Undampened shadow cache file path
    pub fn shadow_cache_path(&self) -> std::path::PathBuf {
        Path::new(&self.data_dir).join("solcast-undampened.json")
    }

    /// API usage cache file path
    pub fn usage_cache_path(&self) -> std::path::PathBuf {
        Path::new(&self.data_dir).join("solcast-usage.json")
    }

    /// Dampening configuration file path
    pub fn dampening_path(&self) -> std::path::PathBuf {
        Path::new(&self.data_dir).join("solcast-dampening.json")
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Base log level
    pub level: String,

    /// Optional console-specific level
    #[serde(default)]
    pub console_level: Option<String>,

    /// Optional file-specific level
    #[serde(default)]
    pub file_level: Option<String>,

    /// Log file path (or directory for rotated files)
    pub file: String,

    /// Number of rotated log files to keep
    pub backup_count: u32,

    /// Also log to stdout
    pub console_output: bool,

    /// Emit JSON-formatted log lines
    pub json_format: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "https://api.solcast.com.au".to_string(),
            request_timeout_secs: 60,
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            auto_update: true,
            interval_minutes: 120,
            guard_minutes: 15,
            fetch_timeout_secs: 900,
            attempts: 10,
            busy_cooldown_secs: 55,
            transient_backoff_secs: 5,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "/data/heliograph".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/tmp/heliograph.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            sites: Vec::new(),
            refresh: RefreshConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            timezone: "UTC".to_string(),
            dampening: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from default locations, falling back to defaults
    pub fn load() -> Result<Self> {
        let default_paths = [
            "heliograph_config.yaml",
            "/data/heliograph_config.yaml",
            "/etc/heliograph/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parse the configured timezone
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| HeliographError::validation("timezone", "unknown IANA timezone name"))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.api.host.is_empty() {
            return Err(HeliographError::validation(
                "api.host",
                "Host cannot be empty",
            ));
        }

        for (i, site) in self.sites.iter().enumerate() {
            if site.resource_id.trim().is_empty() {
                return Err(HeliographError::validation(
                    "sites.resource_id",
                    &format!("Site {} has an empty resource id", i),
                ));
            }
            if site.api_key.trim().is_empty() {
                return Err(HeliographError::validation(
                    "sites.api_key",
                    &format!("Site {} has an empty API key", i),
                ));
            }
            if site.daily_limit == 0 {
                return Err(HeliographError::validation(
                    "sites.daily_limit",
                    &format!("Site {} daily limit must be greater than 0", i),
                ));
            }
        }

        if self.refresh.attempts == 0 {
            return Err(HeliographError::validation(
                "refresh.attempts",
                "Must be greater than 0",
            ));
        }

        if self.refresh.interval_minutes == 0 {
            return Err(HeliographError::validation(
                "refresh.interval_minutes",
                "Must be greater than 0",
            ));
        }

        if self.refresh.fetch_timeout_secs == 0 {
            return Err(HeliographError::validation(
                "refresh.fetch_timeout_secs",
                "Must be greater than 0",
            ));
        }

        if self.storage.data_dir.is_empty() {
            return Err(HeliographError::validation(
                "storage.data_dir",
                "Data directory cannot be empty",
            ));
        }

        if let Some(factors) = &self.dampening {
            if factors.len() != 24 {
                return Err(HeliographError::validation(
                    "dampening",
                    "Initial dampening must hold 24 hourly factors",
                ));
            }
            if factors.iter().any(|f| !(0.0..=1.0).contains(f)) {
                return Err(HeliographError::validation(
                    "dampening",
                    "Dampening factors must be between 0.0 and 1.0",
                ));
            }
        }

        self.tz()?;

        Ok(())
    }

    /// Distinct credentials across all sites, preserving first-seen order
    pub fn credentials(&self) -> Vec<(String, u32)> {
        let mut seen: Vec<(String, u32)> = Vec::new();
        for site in &self.sites {
            if !seen.iter().any(|(k, _)| k == &site.api_key) {
                seen.push((site.api_key.clone(), site.daily_limit));
            }
        }
        seen
    }
}
