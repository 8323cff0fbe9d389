//! Artifact builders.
//!
//! A builder turns one artifact source (a model definition) into its compiled
//! form at a given output path.

use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::PrecompileError;

/// Placeholder replaced by the artifact source path.
pub const SOURCE_PLACEHOLDER: &str = "{source}";
/// Placeholder replaced by the compiled output path.
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Maximum number of stderr characters kept in a build failure.
const STDERR_TAIL: usize = 2000;

/// Trait for artifact builders.
#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    /// Builds `source` into `output`.
    ///
    /// Must leave a complete artifact at `output` on success.
    async fn build(&self, source: &Path, output: &Path) -> Result<(), PrecompileError>;
}

/// Builds artifacts by running an external compiler command.
///
/// Arguments may contain `{source}` and `{output}` placeholders.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    program: String,
    args: Vec<String>,
}

impl CommandBuilder {
    /// Creates a builder running `program` with `args`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Creates a builder from a full command line (`[program, args...]`).
    pub fn from_command_line(command: &[String]) -> Result<Self, PrecompileError> {
        let (program, args) = command.split_first().ok_or(PrecompileError::NoCompiler)?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }

    fn render_args(&self, source: &Path, output: &Path) -> Vec<String> {
        let source = source.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(SOURCE_PLACEHOLDER, &source)
                    .replace(OUTPUT_PLACEHOLDER, &output)
            })
            .collect()
    }
}

#[async_trait]
impl ArtifactBuilder for CommandBuilder {
    async fn build(&self, source: &Path, output: &Path) -> Result<(), PrecompileError> {
        let args = self.render_args(source, output);
        debug!(program = %self.program, args = ?args, "Running artifact compiler");

        let start = Instant::now();
        let result = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| PrecompileError::BuildFailed {
                source_path: source.to_path_buf(),
                reason: format!("failed to run {}: {}", self.program, e),
            })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let skip = stderr.chars().count().saturating_sub(STDERR_TAIL);
            let tail: String = stderr.chars().skip(skip).collect();
            return Err(PrecompileError::BuildFailed {
                source_path: source.to_path_buf(),
                reason: format!("compiler exited with {}: {}", result.status, tail.trim()),
            });
        }

        if !output.exists() {
            return Err(PrecompileError::BuildFailed {
                source_path: source.to_path_buf(),
                reason: format!("compiler did not produce {}", output.display()),
            });
        }

        info!(
            source = %source.display(),
            output = %output.display(),
            elapsed_secs = start.elapsed().as_secs_f64(),
            "Compiled artifact"
        );

        Ok(())
    }
}
