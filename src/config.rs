//! TOML configuration for coordinators and the simulator.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backing::MemoryOptions;
use crate::quota::DEFAULT_WRITE_COST;

/// Everything a manager needs to build coordinators.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Space accounting.
    pub quota: QuotaSection,
    /// Backing-store behaviour.
    pub storage: StorageSection,
    /// Log output.
    pub logging: LoggingSection,
}

/// `[quota]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaSection {
    /// Fixed cost of any write, in bytes.
    pub write_cost: u64,
    /// Per-origin byte budget; unlimited when absent.
    pub origin_limit_bytes: Option<u64>,
}

impl Default for QuotaSection {
    fn default() -> Self {
        Self {
            write_cost: DEFAULT_WRITE_COST,
            origin_limit_bytes: None,
        }
    }
}

/// `[storage]` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Keep databases in memory only; idle closes are refused.
    pub ephemeral: bool,
    /// Let read-write transactions on disjoint scopes run at once.
    pub simultaneous_read_write: bool,
}

impl From<StorageSection> for MemoryOptions {
    fn from(section: StorageSection) -> Self {
        MemoryOptions {
            ephemeral: section.ephemeral,
            simultaneous_read_write: section.simultaneous_read_write,
        }
    }
}

/// `[logging]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `EnvFilter` directive string.
    pub filter: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// In-memory databases that never close while idle, with scopes
    /// writable in parallel.
    pub fn ephemeral() -> Self {
        Self {
            storage: StorageSection {
                ephemeral: true,
                simultaneous_read_write: true,
            },
            ..Self::default()
        }
    }

    /// One writer at a time and a 64 MiB budget per origin.
    pub fn durable() -> Self {
        Self {
            quota: QuotaSection {
                origin_limit_bytes: Some(64 * 1024 * 1024),
                ..QuotaSection::default()
            },
            storage: StorageSection {
                ephemeral: false,
                simultaneous_read_write: false,
            },
            ..Self::default()
        }
    }

    /// Reads the config from `explicit`, or from the default location.
    /// A missing file yields the defaults.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        match explicit.or_else(default_config_path) {
            Some(path) if path.exists() => read_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Writes the config to `explicit` or the default location and returns
    /// the path written.
    pub fn persist(&self, explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
        let target = explicit
            .or_else(default_config_path)
            .ok_or(ConfigError::NoConfigPath)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let serialized =
            toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })?;
        fs::write(&target, serialized).map_err(|source| ConfigError::Write {
            path: target.clone(),
            source,
        })?;
        Ok(target)
    }
}

fn read_file(path: &Path) -> Result<CoordinatorConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Failure to read or write a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this config.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// The config could not be turned into TOML.
    #[error("failed to serialize config: {source}")]
    Serialize {
        /// Underlying error.
        source: toml::ser::Error,
    },
    /// The file could not be written.
    #[error("failed to write config {path}: {source}")]
    Write {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The parent directory could not be created.
    #[error("failed to create config directory {path}: {source}")]
    CreateDir {
        /// Directory path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// No path was given and the platform has no config directory.
    #[error("no config directory found; pass --config or set IDB_SIM_CONFIG")]
    NoConfigPath,
}

/// `<config dir>/idb-coordinator/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("idb-coordinator").join("config.toml"))
}
