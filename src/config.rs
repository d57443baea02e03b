//! Configuration management for todoly-sync
//!
//! This module handles loading, parsing, and validation of configuration files.

use crate::constants::{
    CONFIG_GENERATED, DEFAULT_API_KEY_ENV, DEFAULT_GROUP_NAMES, DEFAULT_POLL_INTERVAL_SECS,
    DEFAULT_REMOTE_GROUPS_TABLE, DEFAULT_REMOTE_TASKS_TABLE, DEFAULT_REMOTE_TIMEOUT_SECS, TOMBSTONE_RETENTION_DAYS,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteConfig,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Remote store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Backend type: "rest" or "memory" (in-process, nothing outlives the process)
    pub backend_type: String,
    /// Base URL of the REST service (required for "rest")
    pub base_url: Option<String>,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub tasks_table: String,
    pub groups_table: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

/// Reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Background drain interval in seconds (0 = only on reconnect or on demand)
    pub poll_interval_secs: u64,
    /// Days a deletion tombstone is kept
    pub tombstone_retention_days: i64,
    /// Initial connectivity flag before any event source reports
    pub assume_online_at_startup: bool,
    /// Groups created for every owner on bootstrap
    pub default_groups: Vec<String>,
}

/// Local store configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the SQLite database file
    pub database_path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Enable logging
    pub enabled: bool,
    /// One of "error", "warn", "info", "debug", "trace"
    pub level: String,
    /// Log file path (defaults to the data directory)
    pub file: Option<PathBuf>,
    /// Also write log lines to stderr
    pub stderr: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            backend_type: "memory".to_string(),
            base_url: None,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            tasks_table: DEFAULT_REMOTE_TASKS_TABLE.to_string(),
            groups_table: DEFAULT_REMOTE_GROUPS_TABLE.to_string(),
            timeout_secs: DEFAULT_REMOTE_TIMEOUT_SECS,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            tombstone_retention_days: TOMBSTONE_RETENTION_DAYS,
            assume_online_at_startup: true,
            default_groups: DEFAULT_GROUP_NAMES.iter().map(|name| name.to_string()).collect(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "info".to_string(),
            file: None,
            stderr: false,
        }
    }
}

impl LoggingConfig {
    /// Parsed `level`, if valid
    pub fn level_filter(&self) -> Option<log::LevelFilter> {
        self.level.parse().ok()
    }
}

impl StorageConfig {
    /// Configured database path, or `<data dir>/todoly/todoly.db`
    pub fn resolved_database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => dirs::data_dir()
                .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))
                .map(|dir| dir.join("todoly").join("todoly.db")),
        }
    }
}

impl Config {
    /// Load configuration from file or return defaults
    pub fn load() -> Result<Self> {
        let config_path = Self::find_config_file()?;

        if let Some(path) = config_path {
            Self::load_from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in order of precedence
    fn find_config_file() -> Result<Option<PathBuf>> {
        // 1. Check current directory
        let current_dir_config = PathBuf::from("todoly.toml");
        if current_dir_config.exists() {
            return Ok(Some(current_dir_config));
        }

        // 2. Check XDG config directory
        if let Some(config_dir) = dirs::config_dir() {
            let xdg_config = config_dir.join("todoly").join("config.toml");
            if xdg_config.exists() {
                return Ok(Some(xdg_config));
            }
        }

        Ok(None)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.validate_remote()?;

        // Validate sync settings
        if self.sync.poll_interval_secs > 86_400 {
            anyhow::bail!("poll_interval_secs cannot exceed 86400 (24 hours)");
        }
        if self.sync.tombstone_retention_days < 1 {
            anyhow::bail!(
                "tombstone_retention_days must be at least 1, got {}",
                self.sync.tombstone_retention_days
            );
        }
        if self.sync.default_groups.iter().any(|name| name.trim().is_empty()) {
            anyhow::bail!("default_groups cannot contain empty names");
        }

        // Validate logging
        if self.logging.level_filter().is_none() {
            anyhow::bail!("Invalid logging level '{}'", self.logging.level);
        }

        Ok(())
    }

    fn validate_remote(&self) -> Result<()> {
        let remote = &self.remote;
        match remote.backend_type.as_str() {
            "memory" => {}
            "rest" => {
                match remote.base_url.as_deref() {
                    Some(url) if url.starts_with("http://") || url.starts_with("https://") => {}
                    Some(url) => anyhow::bail!("remote.base_url must be an http(s) URL, got '{}'", url),
                    None => anyhow::bail!("remote.base_url is required for the 'rest' backend"),
                }
                if remote.api_key_env.is_empty() {
                    anyhow::bail!("remote.api_key_env cannot be empty");
                }
                if remote.tasks_table.is_empty() || remote.groups_table.is_empty() {
                    anyhow::bail!("remote table names cannot be empty");
                }
            }
            backend_type => anyhow::bail!("unsupported backend_type '{}'", backend_type),
        }

        if remote.timeout_secs == 0 || remote.timeout_secs > 300 {
            anyhow::bail!("timeout_secs must be between 1 and 300, got {}", remote.timeout_secs);
        }
        Ok(())
    }

    /// Generate default configuration file
    pub fn generate_default_config<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = Self::default();
        let toml_content = toml::to_string_pretty(&config).context("Failed to serialize default config")?;

        // Add header comment
        let header = format!(
            "# todoly-sync Configuration File\n# Generated on {}\n\n",
            chrono::Local::now().format("%Y-%m-%d")
        );

        let full_content = header + &toml_content;

        // Ensure the parent directory exists
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        std::fs::write(&path, full_content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        log::info!("{}: {}", CONFIG_GENERATED, path.as_ref().display());
        Ok(())
    }

    /// Get the XDG config directory path
    pub fn get_xdg_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
            .map(|dir| dir.join("todoly"))
    }

    /// Get the default config file path
    pub fn get_default_config_path() -> Result<PathBuf> {
        Ok(Self::get_xdg_config_dir()?.join("config.toml"))
    }
}
