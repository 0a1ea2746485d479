//! Configuration management for alarmcore
//!
//! This module handles loading, parsing, and managing configuration from:
//! 1. Embedded default_config.toml (compile-time defaults)
//! 2. User config at ~/.config/alarmcore/config.toml (or platform-specific location)
//! 3. Project-local config at ./.alarmcore/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use crate::error::ConfigError;

/// Default configuration embedded in binary
const DEFAULT_CONFIG: &str = include_str!("../../default_config.toml");

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// When a normal wake-up is paired with an inexact fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackPolicy {
    /// Rely on exact delivery only
    Never,
    /// Add a fallback when the timer service refuses exact wake-ups
    WhenExactUnavailable,
    /// Always add a fallback
    Always,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self::WhenExactUnavailable
    }
}

/// Scheduling behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingConfig {
    #[serde(default = "default_snooze_minutes")]
    pub snooze_minutes: u32,
    #[serde(default = "default_autosilence_minutes")]
    pub autosilence_minutes: u32,
    #[serde(default)]
    pub inexact_fallback: FallbackPolicy,
    #[serde(default = "default_inexact_margin_minutes")]
    pub inexact_margin_minutes: u32,
    #[serde(default = "default_delivery_tolerance_secs")]
    pub delivery_tolerance_secs: u32,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            snooze_minutes: default_snooze_minutes(),
            autosilence_minutes: default_autosilence_minutes(),
            inexact_fallback: FallbackPolicy::default(),
            inexact_margin_minutes: default_inexact_margin_minutes(),
            delivery_tolerance_secs: default_delivery_tolerance_secs(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

impl SchedulingConfig {
    pub fn snooze_duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.snooze_minutes))
    }

    /// `None` when auto-silence is turned off
    pub fn autosilence_duration(&self) -> Option<chrono::Duration> {
        (self.autosilence_minutes > 0)
            .then(|| chrono::Duration::minutes(i64::from(self.autosilence_minutes)))
    }

    pub fn inexact_margin(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.inexact_margin_minutes))
    }

    pub fn delivery_tolerance(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(self.delivery_tolerance_secs))
    }
}

/// Persistence settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    /// Store location (defaults to <data_local_dir>/alarmcore/alarms.json).
    ///
    /// A leading `~` in a configured path expands to the home directory.
    pub fn store_path(&self) -> PathBuf {
        self.path
            .as_deref()
            .map(|path| PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref()))
            .or_else(|| dirs::data_local_dir().map(|dir| dir.join("alarmcore").join("alarms.json")))
            .unwrap_or_else(|| PathBuf::from("alarms.json"))
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_true")]
    pub timestamps: bool,
    #[serde(default = "default_false")]
    pub file_line: bool,
    #[serde(default = "default_true")]
    pub file_output: bool,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            timestamps: true,
            file_line: false,
            file_output: true,
            file_path: None,
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_snooze_minutes() -> u32 {
    9
}

fn default_autosilence_minutes() -> u32 {
    10
}

fn default_inexact_margin_minutes() -> u32 {
    5
}

fn default_delivery_tolerance_secs() -> u32 {
    5
}

fn default_event_queue_capacity() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

// ============================================================================
// Configuration loading
// ============================================================================

impl AppConfig {
    /// Load configuration with fallback chain:
    /// 1. Project-local .alarmcore/config.toml
    /// 2. User config ~/.config/alarmcore/config.toml
    /// 3. Embedded default_config.toml
    pub fn load() -> Result<Self, ConfigError> {
        let mut config: AppConfig = toml::from_str(DEFAULT_CONFIG).map_err(|e| {
            ConfigError::ParseError(format!("Failed to parse default config: {}", e))
        })?;

        for path in [Self::user_config_path(), Self::project_config_path()]
            .into_iter()
            .flatten()
        {
            if !path.exists() {
                continue;
            }
            match Self::load_from_file(&path) {
                Ok(overlay) => {
                    config = overlay;
                    tracing::info!("Loaded config from {:?}", path);
                }
                Err(e) => {
                    tracing::warn!("Failed to load config {:?}: {}", path, e);
                }
            }
        }

        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// Sections and keys missing from the file take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        toml::from_str(&contents).map_err(|e| {
            ConfigError::ParseError(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Get the user config path (~/.config/alarmcore/config.toml)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|config_dir| config_dir.join("alarmcore").join("config.toml"))
    }

    /// Get the project-local config path (./.alarmcore/config.toml)
    pub fn project_config_path() -> Option<PathBuf> {
        std::env::current_dir()
            .ok()
            .map(|cwd| cwd.join(".alarmcore").join("config.toml"))
    }

    /// Write configuration to `path`
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let toml_string =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml_string).map_err(|e| ConfigError::IoError(e.to_string()))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG).unwrap_or_else(|_| Self {
            scheduling: SchedulingConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        })
    }
}
