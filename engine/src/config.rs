//! Engine configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Default copy chunk size (64 KiB).
pub const DEFAULT_CLUSTER_SIZE: u64 = 64 * 1024;

/// Default bitmap granularity used when a request does not name one.
pub const DEFAULT_GRANULARITY: u64 = 64 * 1024;

/// Tunables for a [`BackupEngine`](crate::engine::BackupEngine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of the chunks a job reads and writes; copy chunks never cross a
    /// cluster boundary.
    pub cluster_size: u64,

    /// Granularity for bitmaps created without an explicit one.
    pub default_granularity: u64,

    /// Upper bound on non-terminal jobs, `None` for unlimited.
    pub max_jobs: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            cluster_size: DEFAULT_CLUSTER_SIZE,
            default_granularity: DEFAULT_GRANULARITY,
            max_jobs: None,
        }
    }
}

impl EngineConfig {
    /// Check that sizes are usable powers of two.
    pub fn validate(&self) -> Result<()> {
        if !self.cluster_size.is_power_of_two() {
            return Err(EngineError::InvalidConfig {
                reason: format!("cluster_size {} is not a power of two", self.cluster_size),
            });
        }
        if !self.default_granularity.is_power_of_two() {
            return Err(EngineError::InvalidConfig {
                reason: format!(
                    "default_granularity {} is not a power of two",
                    self.default_granularity
                ),
            });
        }
        if self.max_jobs == Some(0) {
            return Err(EngineError::InvalidConfig {
                reason: "max_jobs must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Parse a JSON configuration document; missing fields take defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    ///
    /// # Errors
    /// `InvalidConfig` if the file cannot be read, or any error of
    /// [`EngineConfig::from_json`].
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| EngineError::InvalidConfig {
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;
        Self::from_json(&text)
    }
}
