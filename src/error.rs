//! Error types for fitpool operations.
//!
//! Defines error types for the major subsystems:
//! - Pool and work function configuration
//! - Job option file expansion
//! - Ledger state transitions and persistence
//! - Artifact precompilation
//! - The pool controller itself
//!
//! Per-job failures (nonzero exits, timeouts, kills) are not errors: they are
//! recorded as ledger states.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Unknown work function '{0}'")]
    UnknownFunction(String),

    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors that can occur while expanding a job options file.
#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("Failed to read options file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Options file has no 'general' section")]
    MissingGeneral,

    #[error("Experiment '{0}' must be a JSON object")]
    InvalidExperiment(String),
}

/// Errors that can occur while mutating or persisting the run ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Slot {0} is not in the ledger")]
    UnknownSlot(usize),

    #[error("Invalid state transition for slot {slot} from '{from}' to '{to}'")]
    InvalidTransition {
        slot: usize,
        from: String,
        to: String,
    },

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Malformed ledger file: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while precompiling shared artifacts.
#[derive(Debug, Error)]
pub enum PrecompileError {
    #[error("Artifact source not found: {0}")]
    SourceNotFound(PathBuf),

    #[error("Failed to build '{source_path}': {reason}")]
    BuildFailed { source_path: PathBuf, reason: String },

    #[error("No artifact compiler configured")]
    NoCompiler,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that propagate out of the pool controller.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Precompilation failed: {0}")]
    Precompile(#[from] PrecompileError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
