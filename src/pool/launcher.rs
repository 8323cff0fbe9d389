//! Launching work functions as isolated OS processes.
//!
//! Each registered work function is a command line. A launched job receives
//! its parameters through the environment:
//!
//! - `FITPOOL_SLOT`: queue position of the job
//! - `FITPOOL_FUNCTION`: work function name
//! - `FITPOOL_JOB`: the full job spec as JSON
//! - `FITPOOL_PARAM_<KEY>`: one variable per scalar ledger column
//!
//! When the job has a result `filename`, stdout and stderr of the process go to
//! the same path with a `.log` extension; otherwise they are discarded.

use std::collections::BTreeMap;
use std::fs;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::ConfigError;
use crate::jobs::Job;

/// Prefix of every variable exported to a job process.
pub const ENV_PREFIX: &str = "FITPOOL_";

/// Command line of one work function.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionSpec {
    /// Executable to run.
    pub program: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl FunctionSpec {
    /// Creates a function spec running `program` with `args`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
        }
    }
}

/// Work functions by name.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, FunctionSpec>,
}

impl FunctionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a work function.
    pub fn with_function(mut self, name: impl Into<String>, spec: FunctionSpec) -> Self {
        self.functions.insert(name.into(), spec);
        self
    }

    /// Looks up a work function.
    pub fn get(&self, name: &str) -> Option<&FunctionSpec> {
        self.functions.get(name)
    }
}

impl From<BTreeMap<String, FunctionSpec>> for FunctionRegistry {
    fn from(functions: BTreeMap<String, FunctionSpec>) -> Self {
        Self { functions }
    }
}

/// Trait for turning a queued job into a running process.
pub trait Launcher: Send + Sync {
    /// Checks that every job can be launched, before anything spawns.
    fn validate(&self, jobs: &[Job]) -> Result<(), ConfigError>;

    /// Starts the process of the job in `slot`.
    ///
    /// Must be called from within a tokio runtime.
    fn launch(&self, slot: usize, job: &Job) -> std::io::Result<Child>;
}

/// Launches registered work functions as child processes.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    registry: FunctionRegistry,
}

impl CommandLauncher {
    /// Creates a launcher over `registry`.
    pub fn new(registry: FunctionRegistry) -> Self {
        Self { registry }
    }

    fn command(&self, slot: usize, job: &Job) -> std::io::Result<Command> {
        let function = self.registry.get(&job.function).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("unknown work function '{}'", job.function),
            )
        })?;

        let mut cmd = Command::new(&function.program);
        cmd.args(&function.args)
            .envs(&function.env)
            .env(format!("{}SLOT", ENV_PREFIX), slot.to_string())
            .env(format!("{}FUNCTION", ENV_PREFIX), &job.function)
            .env(format!("{}JOB", ENV_PREFIX), serde_json::to_string(&job.spec)?)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        for (key, value) in job.spec.columns() {
            cmd.env(param_env_key(&key), param_env_value(&value));
        }

        match &job.spec.filename {
            Some(filename) => {
                let log_path = filename.with_extension("log");
                if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                let log = fs::File::create(&log_path)?;
                cmd.stdout(Stdio::from(log.try_clone()?))
                    .stderr(Stdio::from(log));
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        Ok(cmd)
    }
}

impl Launcher for CommandLauncher {
    fn validate(&self, jobs: &[Job]) -> Result<(), ConfigError> {
        match jobs.iter().find(|job| self.registry.get(&job.function).is_none()) {
            Some(job) => Err(ConfigError::UnknownFunction(job.function.clone())),
            None => Ok(()),
        }
    }

    fn launch(&self, slot: usize, job: &Job) -> std::io::Result<Child> {
        let child = self.command(slot, job)?.spawn()?;
        debug!(slot = slot, pid = ?child.id(), function = %job.function, "Spawned job process");
        Ok(child)
    }
}

/// `FITPOOL_PARAM_<KEY>`, with the key upper-cased and non-alphanumerics as `_`.
fn param_env_key(key: &str) -> String {
    let normalized: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{}PARAM_{}", ENV_PREFIX, normalized)
}

fn param_env_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
