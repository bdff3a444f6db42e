//! Pool configuration: loading and persistence.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fsutil;

/// Grace period before a freshly restored replica becomes removable.
pub const DEFAULT_GRACE_LOCK_MS: u64 = 60_000;

/// Pause between retries when the naming authority times out.
pub const DEFAULT_AUTHORITY_RETRY_MS: u64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Root of the pool tree (`data/` and `control/` live beneath it).
    pub base_dir: PathBuf,
    /// Total capacity handed to the space monitor, in bytes.
    pub total_space: u64,
    #[serde(default = "default_grace_lock_ms")]
    pub grace_lock_ms: u64,
    #[serde(default = "default_authority_retry_ms")]
    pub authority_retry_ms: u64,
}

impl PoolConfig {
    pub fn new(base_dir: impl Into<PathBuf>, total_space: u64) -> Self {
        Self {
            base_dir: base_dir.into(),
            total_space,
            grace_lock_ms: DEFAULT_GRACE_LOCK_MS,
            authority_retry_ms: DEFAULT_AUTHORITY_RETRY_MS,
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })
    }

    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Render)?;
        fsutil::atomic_write(path, contents.as_bytes()).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn default_grace_lock_ms() -> u64 {
    DEFAULT_GRACE_LOCK_MS
}

fn default_authority_retry_ms() -> u64 {
    DEFAULT_AUTHORITY_RETRY_MS
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
}
