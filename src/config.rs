//! Configuration management for notecore.
//!
//! This module handles loading and saving application configuration to/from
//! a JSON file. The config directory can be customized.
//!
//! Includes sync-related configuration:
//! - device_id: UUID7 identifying this device (generated on first run)
//! - sync: remote endpoint, retry policy and connectivity debounce

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{NoteError, NoteResult};

/// Sync configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Base URL of the remote notes API (e.g. "https://notes.example.com")
    #[serde(default)]
    pub remote_url: Option<String>,
    /// Attempts before an entry is parked in the Error state
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Upper bound of the random extra delay, as a fraction of the backoff
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// How long connectivity must stay up before a reconnect triggers a flush
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_jitter_ratio() -> f64 {
    0.2
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_debounce_ms() -> u64 {
    2_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            remote_url: None,
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_ratio: default_jitter_ratio(),
            request_timeout_secs: default_request_timeout_secs(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigData {
    /// Path to the database file
    #[serde(default)]
    pub database_file: String,
    /// Device ID (UUID7 hex)
    #[serde(default = "generate_device_id")]
    pub device_id: String,
    /// Human-readable device name
    #[serde(default = "get_default_device_name")]
    pub device_name: String,
    /// Whether the user granted permission for system notifications
    #[serde(default)]
    pub notifications_granted: bool,
    /// Sync configuration
    #[serde(default)]
    pub sync: SyncConfig,
}

fn generate_device_id() -> String {
    Uuid::now_v7().simple().to_string()
}

fn get_default_device_name() -> String {
    #[cfg(feature = "desktop")]
    {
        match hostname::get() {
            Ok(name) => format!("Notes on {}", name.to_string_lossy()),
            Err(_) => "Notes Device".to_string(),
        }
    }
    #[cfg(not(feature = "desktop"))]
    {
        "Notes Device".to_string()
    }
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            database_file: String::new(),
            device_id: generate_device_id(),
            device_name: get_default_device_name(),
            notifications_granted: false,
            sync: SyncConfig::default(),
        }
    }
}

/// Configuration manager
pub struct Config {
    config_dir: PathBuf,
    config_file: PathBuf,
    data: ConfigData,
}

impl Config {
    /// Create a new configuration manager
    ///
    /// Without the `desktop` feature, `config_dir` is required.
    pub fn new(config_dir: Option<PathBuf>) -> NoteResult<Self> {
        let config_dir = match config_dir {
            Some(dir) => dir,
            None => {
                #[cfg(feature = "desktop")]
                {
                    dirs::config_dir()
                        .unwrap_or_else(|| PathBuf::from("."))
                        .join("notecore")
                }
                #[cfg(not(feature = "desktop"))]
                {
                    return Err(NoteError::Config(
                        "config_dir is required on this platform".to_string(),
                    ));
                }
            }
        };

        fs::create_dir_all(&config_dir)?;
        let config_file = config_dir.join("config.json");

        let default_data = || {
            let mut default = ConfigData::default();
            default.database_file = config_dir.join("notes.db").to_string_lossy().to_string();
            default
        };

        let data = if config_file.exists() {
            match fs::read_to_string(&config_file) {
                Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Unreadable config file, using defaults");
                    default_data()
                }),
                Err(_) => default_data(),
            }
        } else {
            default_data()
        };

        let config = Self {
            config_dir,
            config_file,
            data,
        };

        // Save default config if it doesn't exist
        if !config.config_file.exists() {
            config.save()?;
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> NoteResult<()> {
        let content = serde_json::to_string_pretty(&self.data)?;
        fs::write(&self.config_file, content)?;
        Ok(())
    }

    /// Get the configuration directory path
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Get the database file path
    pub fn database_file(&self) -> &str {
        &self.data.database_file
    }

    /// Get the device ID
    pub fn device_id(&self) -> NoteResult<Uuid> {
        Uuid::parse_str(&self.data.device_id)
            .map_err(|e| NoteError::Config(format!("Invalid device_id: {}", e)))
    }

    pub fn device_id_hex(&self) -> &str {
        &self.data.device_id
    }

    pub fn device_name(&self) -> &str {
        &self.data.device_name
    }

    pub fn set_device_name(&mut self, name: &str) -> NoteResult<()> {
        self.data.device_name = name.to_string();
        self.save()
    }

    pub fn notifications_granted(&self) -> bool {
        self.data.notifications_granted
    }

    /// Record the user's answer to the notification permission prompt
    pub fn set_notifications_granted(&mut self, granted: bool) -> NoteResult<()> {
        self.data.notifications_granted = granted;
        self.save()
    }

    pub fn sync_config(&self) -> &SyncConfig {
        &self.data.sync
    }

    pub fn is_sync_enabled(&self) -> bool {
        self.data.sync.enabled
    }

    pub fn set_sync_enabled(&mut self, enabled: bool) -> NoteResult<()> {
        self.data.sync.enabled = enabled;
        self.save()
    }

    pub fn remote_url(&self) -> Option<&str> {
        self.data.sync.remote_url.as_deref()
    }

    /// Set the remote API base URL
    pub fn set_remote_url(&mut self, url: &str) -> NoteResult<()> {
        let trimmed = url.trim().trim_end_matches('/');
        if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
            return Err(NoteError::validation(
                "remote_url",
                "must start with http:// or https://",
            ));
        }
        self.data.sync.remote_url = Some(trimmed.to_string());
        self.save()
    }

    pub fn set_max_attempts(&mut self, max_attempts: u32) -> NoteResult<()> {
        if max_attempts == 0 {
            return Err(NoteError::validation("max_attempts", "must be at least 1"));
        }
        self.data.sync.max_attempts = max_attempts;
        self.save()
    }

    /// Get a configuration value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "database_file" => Some(self.data.database_file.clone()),
            "device_id" => Some(self.data.device_id.clone()),
            "device_name" => Some(self.data.device_name.clone()),
            "remote_url" => self.data.sync.remote_url.clone(),
            "max_attempts" => Some(self.data.sync.max_attempts.to_string()),
            _ => None,
        }
    }

    /// Set a configuration value
    pub fn set(&mut self, key: &str, value: &str) -> NoteResult<()> {
        match key {
            "database_file" => self.data.database_file = value.to_string(),
            "device_name" => self.data.device_name = value.to_string(),
            "remote_url" => return self.set_remote_url(value),
            "max_attempts" => {
                let parsed = value.parse::<u32>().map_err(|e| {
                    NoteError::validation("max_attempts", e.to_string())
                })?;
                return self.set_max_attempts(parsed);
            }
            _ => return Err(NoteError::Config(format!("Unknown config key: {}", key))),
        }
        self.save()
    }
}
