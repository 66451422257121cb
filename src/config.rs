// src/config.rs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Process-wide defaults, handed to the engine at construction.
///
/// Every field has a default, so a JSON file only needs the keys it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Longest wait for the next chunk of a response body.
    pub read_timeout_ms: u64,
    /// Longest wait for response headers.
    pub connect_timeout_ms: u64,
    pub max_concurrent_downloads: usize,
    pub user_agent: String,
    /// SQLite file holding resume checkpoints. `None` keeps them in memory.
    pub database_path: Option<PathBuf>,
    /// Minimum gap between two progress events of the same download.
    pub progress_interval_ms: u64,
    /// A periodic checkpoint needs at least this many new bytes...
    pub sync_min_bytes: u64,
    /// ...and at least this much time since the previous one.
    pub sync_interval_ms: u64,
    /// Extend the data file to the advertised size before writing.
    pub preallocate: bool,
    /// When a resume is answered with the full body, start over instead of failing.
    pub restart_on_range_ignored: bool,
    pub write_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 20_000,
            connect_timeout_ms: 20_000,
            max_concurrent_downloads: 3,
            user_agent: concat!("odm/", env!("CARGO_PKG_VERSION")).to_string(),
            database_path: None,
            progress_interval_ms: 100,
            sync_min_bytes: 65_536,
            sync_interval_ms: 2_000,
            preallocate: false,
            restart_on_range_ignored: true,
            write_buffer_size: 8 * 1024,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_downloads == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if self.write_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "write_buffer_size must be positive".to_string(),
            ));
        }
        if self.read_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".to_string()));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}
