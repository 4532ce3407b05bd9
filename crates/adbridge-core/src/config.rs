//! Configuration module for AdBridge.
//!
//! Provides typed configuration structs that map to the YAML configuration
//! file, with loading, validation and defaults. The forest list inside the
//! configuration is the input to the diff-driven configuration lifecycle;
//! it is persisted only once the comparator-derived edit script commits.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::Forest;

/// Top-level configuration for AdBridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdConfig {
    pub sync: SyncConfig,
    pub anomaly: AnomalyConfig,
    pub web: WebConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    /// Forest configurations to reconcile against the store
    #[serde(default)]
    pub forests: Vec<Forest>,
}

/// Directory synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Master switch; when false the monitor idles
    pub enabled: bool,
    /// Minutes between automatic sync cycles
    pub interval_mins: u32,
    /// LDAP page size for subgroup and user enumeration
    pub page_size: u32,
    /// Whether to fetch and push user avatars
    pub enable_avatars: bool,
    /// Whether subgroups are pushed to the cloud as groups
    pub enable_subgroups: bool,
    /// Whether distinguished-name based authentication is enabled
    pub enable_dn_auth: bool,
    /// Days of event log history to retain
    pub event_retention_days: u32,
}

/// Mass-deletion anomaly guard settings.
///
/// Thresholds are process-global but evaluated independently per forest:
/// each forest's cycle compares its own not-present count against
/// `max(user_count_threshold, ceil(previously_present * percent / 100))`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    pub enabled: bool,
    /// Absolute floor: populations below this are never judged
    pub user_count_threshold: i64,
    /// Percentage of the previously present population
    pub percent_threshold: u32,
}

/// Cloud endpoint settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebConfig {
    /// Base address of the cloud identity provider, e.g. `https://host`
    pub server_address: String,
    /// Pre-shared API key for Basic authentication
    pub api_key: String,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
}

/// Local cache database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
}

impl AdConfig {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AdConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`AdConfig::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("adbridge")
            .join("config.yaml")
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_mins: 15,
            page_size: 100,
            enable_avatars: false,
            enable_subgroups: true,
            enable_dn_auth: false,
            event_retention_days: 30,
        }
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            user_count_threshold: 20,
            percent_threshold: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("adbridge");
        Self {
            path: data_dir.join("adbridge.db"),
        }
    }
}

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.interval_mins"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl AdConfig {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.sync.enabled && self.sync.interval_mins == 0 {
            errors.push(ValidationError {
                field: "sync.interval_mins".into(),
                message: "must be at least 1 minute".into(),
            });
        }
        if self.sync.page_size == 0 {
            errors.push(ValidationError {
                field: "sync.page_size".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.anomaly.percent_threshold > 100 {
            errors.push(ValidationError {
                field: "anomaly.percent_threshold".into(),
                message: "must be between 0 and 100".into(),
            });
        }
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
            });
        }
        if self.sync.enabled && self.web.server_address.is_empty() {
            errors.push(ValidationError {
                field: "web.server_address".into(),
                message: "required when sync is enabled".into(),
            });
        }
        for (index, forest) in self.forests.iter().enumerate() {
            if let Err(e) = forest.validate() {
                errors.push(ValidationError {
                    field: format!("forests[{index}]"),
                    message: e.to_string(),
                });
            }
        }

        errors
    }
}
