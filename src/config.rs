//! TOML configuration parsing for the command-line front-end.

use crate::engine::hash::Algorithm;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("config names no data disks")]
    NoDisks,
    #[error("config names no parity splits")]
    NoParity,
    #[error("unknown hash algorithm {0:?}, expected \"murmur3\" or \"metro\"")]
    UnknownAlgorithm(String),
    #[error("block_size must be non-zero")]
    ZeroBlockSize,
    #[error("duplicate disk name {0:?}")]
    DuplicateDiskName(String),
}

#[derive(Debug, Deserialize)]
pub struct DiskConfig {
    pub name: String,
    pub mount_point: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct ParityConfig {
    pub level: u8,
    pub splits: Vec<PathBuf>,
}

fn default_block_size() -> u32 {
    256 * 1024
}

fn default_autosave_interval() -> u64 {
    1024 * 1024 * 1024
}

fn default_io_error_limit() -> u32 {
    100
}

fn default_algorithm() -> String {
    "murmur3".to_string()
}

fn default_scrub_percentage() -> f64 {
    8.0
}

fn default_scrub_older_than_days() -> u32 {
    10
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default = "default_autosave_interval")]
    pub autosave_interval_bytes: u64,
    #[serde(default = "default_io_error_limit")]
    pub io_error_limit: u32,
    /// "murmur3" (long-standing default) or "metro" (newer, used once a
    /// full rehash has completed).
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_scrub_percentage")]
    pub scrub_percentage: f64,
    #[serde(default = "default_scrub_older_than_days")]
    pub scrub_older_than_days: u32,
    pub content: Vec<PathBuf>,
    pub disk: Vec<DiskConfig>,
    pub parity: Vec<ParityConfig>,
    #[serde(default)]
    pub smartctl: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.disk.is_empty() {
            return Err(ConfigError::NoDisks);
        }
        if self.parity.is_empty() {
            return Err(ConfigError::NoParity);
        }
        if self.block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        let mut seen = std::collections::HashSet::new();
        for disk in &self.disk {
            if !seen.insert(disk.name.as_str()) {
                return Err(ConfigError::DuplicateDiskName(disk.name.clone()));
            }
        }
        self.algorithm()?;
        Ok(())
    }

    pub fn algorithm(&self) -> Result<Algorithm, ConfigError> {
        match self.algorithm.as_str() {
            "murmur3" => Ok(Algorithm::Murmur3_128),
            "metro" => Ok(Algorithm::Metro128),
            other => Err(ConfigError::UnknownAlgorithm(other.to_string())),
        }
    }
}
