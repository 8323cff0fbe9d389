//! Deduplicated, staleness-checked precompilation of shared artifacts.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use super::builder::ArtifactBuilder;
use crate::error::PrecompileError;
use crate::jobs::Job;

/// Default extension of compiled artifacts.
pub const DEFAULT_COMPILED_EXTENSION: &str = "pkl";

/// What `ensure` did for one artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecompileOutcome {
    /// Already validated earlier in this run.
    AlreadyChecked,
    /// Compiled output exists and is not older than its source.
    UpToDate,
    /// The builder was invoked.
    Built,
}

/// Builds every shared artifact at most once per run.
pub struct Precompiler {
    builder: Arc<dyn ArtifactBuilder>,
    extension: String,
    force: bool,
    checked: HashSet<PathBuf>,
}

impl Precompiler {
    /// Creates a precompiler delegating builds to `builder`.
    pub fn new(builder: Arc<dyn ArtifactBuilder>) -> Self {
        Self {
            builder,
            extension: DEFAULT_COMPILED_EXTENSION.to_string(),
            force: false,
            checked: HashSet::new(),
        }
    }

    /// Sets the extension of compiled outputs.
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Rebuilds artifacts even when their outputs are fresh.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Where the compiled form of `source` lives.
    pub fn output_path(&self, source: &Path) -> PathBuf {
        source.with_extension(&self.extension)
    }

    /// Makes sure the compiled form of `source` exists and is current.
    pub async fn ensure(
        &mut self,
        source: &Path,
        force: bool,
    ) -> Result<PrecompileOutcome, PrecompileError> {
        let output = self.output_path(source);
        if self.checked.contains(&output) {
            return Ok(PrecompileOutcome::AlreadyChecked);
        }

        let source_meta = tokio::fs::metadata(source)
            .await
            .map_err(|_| PrecompileError::SourceNotFound(source.to_path_buf()))?;

        if !force && is_fresh(&output, &source_meta).await? {
            info!(output = %output.display(), "Using precompiled artifact");
            self.checked.insert(output);
            return Ok(PrecompileOutcome::UpToDate);
        }

        self.builder.build(source, &output).await?;
        self.checked.insert(output);
        Ok(PrecompileOutcome::Built)
    }

    /// Precompiles every model and premodel referenced by the queue.
    ///
    /// Returns the number of artifacts actually built.
    pub async fn prepare(&mut self, jobs: &[Job]) -> Result<usize, PrecompileError> {
        let mut built = 0;
        for source in jobs.iter().flat_map(|job| job.spec.artifact_sources()) {
            if self.ensure(&source, self.force).await? == PrecompileOutcome::Built {
                built += 1;
            }
        }

        info!(
            artifacts = self.checked.len(),
            built = built,
            "Precompilation complete"
        );

        Ok(built)
    }
}

async fn is_fresh(output: &Path, source_meta: &std::fs::Metadata) -> Result<bool, PrecompileError> {
    let output_meta = match tokio::fs::metadata(output).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    Ok(output_meta.modified()? >= source_meta.modified()?)
}
