//! Configuration module for sensorboard-rs
//!
//! This module holds the tunables of a board connection: how long the
//! allocation protocol waits for identifier replies, how long register reads
//! may take, the board's tick period and the download defaults.
//!
//! # Data Location
//!
//! The config file is stored in the platform-appropriate location:
//! - **Linux**: `~/.local/share/dev.hxyulin.sensorboard-rs/`
//! - **macOS**: `~/Library/Application Support/dev.hxyulin.sensorboard-rs/`
//! - **Windows**: `%APPDATA%\dev.hxyulin.sensorboard-rs\`
//!
//! # Example
//!
//! ```ignore
//! use sensorboard::config::BoardConfig;
//!
//! let mut config = BoardConfig::load_or_default();
//! config.download.progress_updates = 20;
//! config.save("board.toml")?;
//! ```

use crate::error::{BoardError, Result, ResultExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for data directories
pub const APP_ID: &str = "dev.hxyulin.sensorboard-rs";

/// Config filename inside the data directory
pub const CONFIG_FILE: &str = "board.toml";

/// Board tick period in milliseconds (48 / 32768 s)
pub const DEFAULT_TICK_PERIOD_MS: f64 = 48.0 / 32768.0 * 1000.0;

/// Get the platform-specific data directory
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Get the path of the default config file
pub fn config_path() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join(CONFIG_FILE))
}

/// Timeouts of the request/reply exchanges with the board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// How long one creation command may wait for its identifier
    pub creation_ms: u64,
    /// How long a register read (length, time, recovery query) may take
    pub read_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            creation_ms: 250,
            read_ms: 1000,
        }
    }
}

/// Log download behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Number of progress updates requested per download
    pub progress_updates: u32,
    /// Remove downloaded entries from the board once a download completes
    pub clear_after_download: bool,
    /// Log slots queried when recovering loggers after a reconnect
    pub log_slot_count: u8,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            progress_updates: 10,
            clear_after_download: false,
            log_slot_count: 8,
        }
    }
}

/// Complete board connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub timeouts: TimeoutConfig,
    pub download: DownloadConfig,
    /// Duration of one board tick in milliseconds
    pub tick_period_ms: f64,
    /// How long the worker blocks waiting for work before checking deadlines
    pub poll_interval_ms: u64,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            download: DownloadConfig::default(),
            tick_period_ms: DEFAULT_TICK_PERIOD_MS,
            poll_interval_ms: 10,
        }
    }
}

impl BoardConfig {
    /// Creation timeout as a [`Duration`]
    pub fn creation_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.creation_ms)
    }

    /// Read timeout as a [`Duration`]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.read_ms)
    }

    /// Worker poll interval as a [`Duration`]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Load a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BoardError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config: BoardConfig = toml::from_str(&content).map_err(|e| {
            BoardError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })?;
        config
            .validate()
            .context(format!("Invalid config file {:?}", path))?;
        Ok(config)
    }

    /// Load the config from the default location, returning defaults on any error
    pub fn load_or_default() -> Self {
        let Some(path) = config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }

        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load board config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the config as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BoardError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| BoardError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            BoardError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// Reject values the protocol cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.tick_period_ms.is_nan() || self.tick_period_ms <= 0.0 {
            return Err(BoardError::Config(format!(
                "tick_period_ms must be positive, got {}",
                self.tick_period_ms
            )));
        }
        if self.timeouts.creation_ms == 0 || self.timeouts.read_ms == 0 {
            return Err(BoardError::Config("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }
}
