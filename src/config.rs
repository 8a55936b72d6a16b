//! # Configuration Management Module
//!
//! Persistent recorder settings stored in platform-appropriate locations.
//! Handles loading, saving, and providing defaults for configuration options.
//!
//! ## Settings
//! - Session defaults: subject id, sampling interval, device-type filter
//! - Link resilience: stall threshold, reconnect cadence, connect retry policy
//! - Durability: periodic flush cadence and output directory
//!
//! ## Storage Location
//! - macOS: ~/Library/Application Support/hr-recorder/config.toml
//! - Linux: ~/.config/hr-recorder/config.toml
//! - Windows: %APPDATA%\hr-recorder\config.toml
//!
//! Every field carries a serde default so files written by older builds
//! keep loading after new settings are added.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub output_dir: PathBuf,
    pub device_type: String,
    pub device_types: Vec<String>,
    pub subject_id: String,
    pub sampling_interval_secs: u64,
    pub stall_threshold_secs: u64,
    pub reconnect_interval_secs: u64,
    pub connect_attempts: u32,
    pub connect_backoff_secs: u64,
    pub flush_interval_secs: u64,
    pub battery_poll_secs: u64,
    pub scan_timeout_secs: u64,
    pub resolve_timeout_secs: u64,
    pub tick_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            device_type: "Polar Sense".to_string(),
            device_types: vec!["Polar Sense".to_string(), "Polar H10".to_string()],
            subject_id: "test".to_string(),
            sampling_interval_secs: 10,
            stall_threshold_secs: 20,
            reconnect_interval_secs: 5,
            connect_attempts: 3,
            connect_backoff_secs: 2,
            flush_interval_secs: 30,
            battery_poll_secs: 60,
            scan_timeout_secs: 5,
            resolve_timeout_secs: 5,
            tick_ms: 50,
        }
    }
}

fn default_output_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("hr-recorder"))
        .unwrap_or_else(|| PathBuf::from("data"))
}

impl Config {
    /// Get the path to the config file
    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hr-recorder")
            .join("config.toml")
    }

    /// Load config from file, or create default if it doesn't exist
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config = toml::from_str(&contents)
                    .map_err(ConfigError::ParseFailed)?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, create default
                let config = Self::default();
                config.save_to(path)?;
                Ok(config)
            }
            Err(e) => Err(ConfigError::ReadFailed(e)),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(ConfigError::SerializeFailed)?;
        fs::write(path, toml_string)
            .map_err(ConfigError::WriteFailed)?;

        Ok(())
    }

    /// Sampling interval clamped to the one second minimum
    pub fn sampling_interval(&self) -> Duration {
        Duration::from_secs(self.sampling_interval_secs.max(1))
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_secs(self.connect_backoff_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn battery_poll_interval(&self) -> Duration {
        Duration::from_secs(self.battery_poll_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}
