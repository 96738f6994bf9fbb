//! Top-level error taxonomy mapping the engine's internal error types
//! onto the exit-code categories the command-line front-end reports.

use crate::config::ConfigError;
use crate::engine::extent::ExtentError;
use crate::engine::manifest::ManifestError;
use crate::engine::raid::RaidError;
use parity_io::ParityIoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("missing resource: {0}")]
    MissingResource(String),

    #[error("structural inconsistency: {0}")]
    Structural(#[from] ManifestError),

    #[error("structural inconsistency in extent map: {0}")]
    ExtentCorruption(#[from] ExtentError),

    #[error("raid codec error: {0}")]
    Raid(#[from] RaidError),

    #[error("parity I/O error: {0}")]
    ParityIo(#[from] ParityIoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Exit code for the command-line front-end: 0 success, 1 for
    /// differences found or errors encountered, 2 for usage errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Config(_) => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
