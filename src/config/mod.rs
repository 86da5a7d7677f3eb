//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`DND_*`)
//! - CLI arguments (for the `dnd` binary)

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DndError, Result};

/// Default chunk size for file and meta data (64 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Hard limit for the meta data buffer (32 MiB).
pub const MAX_META_SIZE: usize = 32 * 1024 * 1024;

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Wait budgets
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Transfer sizing and staging
    #[serde(default)]
    pub transfer: TransferConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| DndError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| DndError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = env_parse("DND_PENDING_CHECK_MS") {
            config.timeouts.pending_check_ms = val;
        }
        if let Some(val) = env_parse("DND_ACK_TIMEOUT_MS") {
            config.timeouts.ack_timeout_ms = val;
        }
        if let Some(val) = env_parse("DND_POLL_SLICE_MS") {
            config.timeouts.poll_slice_ms = val;
        }
        if let Some(val) = env_parse("DND_TRANSFER_TIMEOUT_MS") {
            config.timeouts.transfer_timeout_ms = val;
        }
        if let Some(val) = env_parse("DND_BLOCK_SIZE") {
            config.transfer.block_size = val;
        }
        if let Ok(dir) = std::env::var("DND_STAGING_DIR") {
            config.transfer.staging_dir = PathBuf::from(dir);
        }

        config
    }

    /// Merge with another config (other takes precedence where it differs from defaults)
    pub fn merge(self, other: Self) -> Self {
        let t_def = TimeoutConfig::default();
        let x_def = TransferConfig::default();

        Self {
            timeouts: TimeoutConfig {
                pending_check_ms: pick(
                    self.timeouts.pending_check_ms,
                    other.timeouts.pending_check_ms,
                    t_def.pending_check_ms,
                ),
                ack_timeout_ms: pick(
                    self.timeouts.ack_timeout_ms,
                    other.timeouts.ack_timeout_ms,
                    t_def.ack_timeout_ms,
                ),
                poll_slice_ms: pick(
                    self.timeouts.poll_slice_ms,
                    other.timeouts.poll_slice_ms,
                    t_def.poll_slice_ms,
                ),
                transfer_timeout_ms: pick(
                    self.timeouts.transfer_timeout_ms,
                    other.timeouts.transfer_timeout_ms,
                    t_def.transfer_timeout_ms,
                ),
            },
            transfer: TransferConfig {
                block_size: pick(
                    self.transfer.block_size,
                    other.transfer.block_size,
                    x_def.block_size,
                ),
                max_meta_size: pick(
                    self.transfer.max_meta_size,
                    other.transfer.max_meta_size,
                    x_def.max_meta_size,
                ),
                staging_dir: pick(
                    self.transfer.staging_dir,
                    other.transfer.staging_dir,
                    x_def.staging_dir,
                ),
            },
        }
    }

    /// Validate value ranges
    pub fn validate(&self) -> Result<()> {
        if self.transfer.block_size == 0 {
            return Err(DndError::Config("block_size must be non-zero".to_string()));
        }
        if self.transfer.max_meta_size > MAX_META_SIZE {
            return Err(DndError::Config(format!(
                "max_meta_size {} exceeds hard limit {}",
                self.transfer.max_meta_size, MAX_META_SIZE
            )));
        }
        if self.timeouts.poll_slice_ms == 0 {
            return Err(DndError::Config("poll_slice_ms must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Set the staging directory
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.transfer.staging_dir = dir.into();
        self
    }

    /// Set the poll slice
    pub fn with_poll_slice(mut self, slice: Duration) -> Self {
        self.timeouts.poll_slice_ms = slice.as_millis() as u64;
        self
    }

    /// Set the overall transfer timeout
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.transfer_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the acknowledgement timeout
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.ack_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the block size
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.transfer.block_size = block_size;
        self
    }
}

fn pick<T: PartialEq>(base: T, other: T, default: T) -> T {
    if other != default {
        other
    } else {
        base
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Wait budgets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Wait for a reply to a "drag pending?" query
    pub pending_check_ms: u64,

    /// Default wait for a single guest acknowledgement
    pub ack_timeout_ms: u64,

    /// Slice length for cancellable waits
    pub poll_slice_ms: u64,

    /// Budget for a whole data transfer
    pub transfer_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            pending_check_ms: 100,
            ack_timeout_ms: 3000,
            poll_slice_ms: 500,
            transfer_timeout_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    /// Pending-check wait as a duration
    pub fn pending_check(&self) -> Duration {
        Duration::from_millis(self.pending_check_ms)
    }

    /// Acknowledgement wait as a duration
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Poll slice as a duration
    pub fn poll_slice(&self) -> Duration {
        Duration::from_millis(self.poll_slice_ms.max(1))
    }

    /// Transfer budget as a duration
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

/// Transfer sizing and staging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Maximum bytes per data chunk
    pub block_size: usize,

    /// Maximum meta buffer size
    pub max_meta_size: usize,

    /// Base directory for dropped files on the receiving side
    pub staging_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_meta_size: MAX_META_SIZE,
            staging_dir: dirs::cache_dir()
                .map(|p| p.join("dnd").join("DroppedFiles"))
                .unwrap_or_else(|| std::env::temp_dir().join("dnd-dropped-files")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.timeouts.pending_check_ms, 100);
        assert_eq!(config.timeouts.ack_timeout_ms, 3000);
        assert_eq!(config.timeouts.poll_slice_ms, 500);
        assert_eq!(config.transfer.block_size, 64 * 1024);
        assert_eq!(config.transfer.max_meta_size, 32 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [timeouts]
            ack_timeout_ms = 1500
            poll_slice_ms = 50

            [transfer]
            block_size = 4096
            staging_dir = "/tmp/dnd-test"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.timeouts.ack_timeout_ms, 1500);
        assert_eq!(config.timeouts.poll_slice_ms, 50);
        assert_eq!(config.timeouts.pending_check_ms, 100);
        assert_eq!(config.transfer.block_size, 4096);
        assert_eq!(config.transfer.staging_dir, PathBuf::from("/tmp/dnd-test"));
    }

    #[test]
    fn test_merge_prefers_non_default() {
        let base = Config::default().with_block_size(1024);
        let other = Config::default().with_poll_slice(Duration::from_millis(20));
        let merged = base.merge(other);
        assert_eq!(merged.transfer.block_size, 1024);
        assert_eq!(merged.timeouts.poll_slice_ms, 20);
    }

    #[test]
    fn test_validate_rejects_zero_block() {
        let config = Config::default().with_block_size(0);
        assert!(config.validate().is_err());
    }
}
