//! Configuration for the pool controller.
//!
//! Tunables come from defaults, `FITPOOL_*` environment variables and CLI
//! flags (in increasing priority). Work functions and the artifact compiler
//! are declared in a YAML file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::launcher::FunctionSpec;
use crate::error::ConfigError;
use crate::precompile::DEFAULT_COMPILED_EXTENSION;

/// Configuration for the pool controller.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of job processes running at once.
    pub max_processes: usize,
    /// Multiplier on the group mean duration before a job counts as stuck.
    pub slack_factor: f64,
    /// Delay between observing an exit or kill and collecting the process.
    pub grace_period: Duration,
    /// Wall-clock ceiling for a single job.
    pub absolute_timeout: Duration,
    /// Longest a wait may block before the timeout sweeps run again.
    pub check_interval: Duration,
    /// Where the ledger is persisted; nothing is written when unset.
    pub ledger_path: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_processes: 2,
            slack_factor: 3.0,
            grace_period: Duration::from_secs(5),
            absolute_timeout: Duration::from_secs(7 * 24 * 3600), // 7 days
            check_interval: Duration::from_secs(600),             // 10 minutes
            ledger_path: None,
        }
    }
}

impl PoolConfig {
    /// Creates a configuration with `max_processes` slots and defaults elsewhere.
    pub fn new(max_processes: usize) -> Self {
        Self {
            max_processes,
            ..Default::default()
        }
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FITPOOL_MAX_PROCESSES`: concurrency ceiling (default: 2)
    /// - `FITPOOL_SLACK_FACTOR`: stuck-job multiplier (default: 3.0)
    /// - `FITPOOL_GRACE_PERIOD`: grace period (default: 5s)
    /// - `FITPOOL_MAX_TIME_PER_JOB`: absolute per-job ceiling (default: 7 days)
    /// - `FITPOOL_CHECK_INTERVAL`: wait bound between sweeps (default: 10 min)
    /// - `FITPOOL_LEDGER_PATH`: ledger output path (default: unset)
    ///
    /// Durations accept the forms understood by [`parse_duration`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("FITPOOL_MAX_PROCESSES") {
            config.max_processes = parse_env_value(&val, "FITPOOL_MAX_PROCESSES")?;
        }

        if let Ok(val) = std::env::var("FITPOOL_SLACK_FACTOR") {
            config.slack_factor = parse_env_value(&val, "FITPOOL_SLACK_FACTOR")?;
        }

        if let Ok(val) = std::env::var("FITPOOL_GRACE_PERIOD") {
            config.grace_period = parse_env_duration(&val, "FITPOOL_GRACE_PERIOD")?;
        }

        if let Ok(val) = std::env::var("FITPOOL_MAX_TIME_PER_JOB") {
            config.absolute_timeout = parse_env_duration(&val, "FITPOOL_MAX_TIME_PER_JOB")?;
        }

        if let Ok(val) = std::env::var("FITPOOL_CHECK_INTERVAL") {
            config.check_interval = parse_env_duration(&val, "FITPOOL_CHECK_INTERVAL")?;
        }

        if let Ok(val) = std::env::var("FITPOOL_LEDGER_PATH") {
            config.ledger_path = Some(PathBuf::from(val));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_processes == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_processes must be greater than 0".to_string(),
            ));
        }

        if !(self.slack_factor.is_finite() && self.slack_factor > 0.0) {
            return Err(ConfigError::ValidationFailed(
                "slack_factor must be a positive number".to_string(),
            ));
        }

        if self.absolute_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "absolute_timeout must be greater than 0".to_string(),
            ));
        }

        if self.check_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "check_interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Sets the concurrency ceiling.
    pub fn with_max_processes(mut self, max: usize) -> Self {
        self.max_processes = max;
        self
    }

    /// Sets the stuck-job multiplier.
    pub fn with_slack_factor(mut self, factor: f64) -> Self {
        self.slack_factor = factor;
        self
    }

    /// Sets the grace period.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Sets the absolute per-job ceiling.
    pub fn with_absolute_timeout(mut self, timeout: Duration) -> Self {
        self.absolute_timeout = timeout;
        self
    }

    /// Sets the wait bound between sweeps.
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Sets the ledger output path.
    pub fn with_ledger_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ledger_path = Some(path.into());
        self
    }
}

/// Artifact compiler declaration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CompilerSpec {
    /// Compiler command line; may use `{source}` and `{output}`.
    pub command: Vec<String>,
    /// Extension of compiled outputs.
    #[serde(default = "default_compiled_extension")]
    pub extension: String,
}

fn default_compiled_extension() -> String {
    DEFAULT_COMPILED_EXTENSION.to_string()
}

/// Contents of the YAML configuration file.
///
/// ```yaml
/// functions:
///   run:
///     program: python
///     args: ["-m", "fit_model"]
/// compiler:
///   command: ["python", "-m", "compile_model", "{source}", "{output}"]
///   extension: pkl
/// ```
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FileConfig {
    /// Work functions by name.
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionSpec>,
    /// Compiler used to precompile shared artifacts.
    #[serde(default)]
    pub compiler: Option<CompilerSpec>,
}

impl FileConfig {
    /// Loads the YAML configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    /// Parses a YAML document.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }
}

/// Parses a human duration: `90`, `1.5`, `30s`, `250ms`, `10 min`, `2h`,
/// `7 days`, `1h 30min`. A bare number is seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let text = input.trim();
    if text.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = 0.0f64;
    let mut rest = text;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("invalid duration '{}'", input));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("invalid number in duration '{}'", input))?;
        rest = rest[number_len..].trim_start();

        let unit_len = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = rest[unit_len..].trim_start();

        let scale = match unit.to_lowercase().as_str() {
            "" | "s" | "sec" | "secs" | "second" | "seconds" => 1.0,
            "ms" | "msec" | "millis" | "millisecond" | "milliseconds" => 0.001,
            "m" | "min" | "mins" | "minute" | "minutes" => 60.0,
            "h" | "hr" | "hrs" | "hour" | "hours" => 3600.0,
            "d" | "day" | "days" => 86_400.0,
            "w" | "week" | "weeks" => 604_800.0,
            other => return Err(format!("unknown duration unit '{}'", other)),
        };
        total += value * scale;
    }

    Duration::try_from_secs_f64(total).map_err(|e| format!("invalid duration '{}': {}", input, e))
}

fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

fn parse_env_duration(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).map_err(|message| ConfigError::InvalidValue {
        key: key.to_string(),
        message,
    })
}
