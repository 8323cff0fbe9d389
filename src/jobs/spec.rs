//! Job definitions for the pool controller.
//!
//! - `JobSpec`: typed parameter set of one model fit
//! - `Job`: a work function name paired with its `JobSpec`
//! - `GroupKey`: the identity used to pool durations of comparable jobs

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Initialization strategies that load secondary (pre)models.
const PREMODEL_INITS: [&str; 2] = ["model_init", "multimodel"];

/// Columns that describe a single run rather than the experiment it belongs to.
///
/// They are excluded when pooling durations into groups.
pub const DIAGNOSTIC_COLUMNS: [&str; 3] = ["filename", "seed", "result"];

/// Column names the ledger reserves for its own bookkeeping.
pub const LEDGER_COLUMNS: [&str; 6] = ["slot", "function", "status", "start", "stop", "duration"];

/// Parameters of a single model fit.
///
/// The controller only looks at the reserved fields; everything else is
/// carried verbatim in `extra` and handed to the work function.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobSpec {
    /// Source of the model definition this job fits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<PathBuf>,
    /// Initialization strategy name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<String>,
    /// Options of the initialization strategy.
    #[serde(
        default,
        rename = "initoptions",
        skip_serializing_if = "Option::is_none"
    )]
    pub init_options: Option<serde_json::Map<String, Value>>,
    /// Where the work function writes its result artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<PathBuf>,
    /// Random seed of the fit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    /// Job-specific parameters.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl JobSpec {
    /// Creates an empty spec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the model source.
    pub fn with_model(mut self, model: impl Into<PathBuf>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the initialization strategy.
    pub fn with_init(mut self, init: impl Into<String>) -> Self {
        self.init = Some(init.into());
        self
    }

    /// Sets the initialization options.
    pub fn with_init_options(mut self, options: serde_json::Map<String, Value>) -> Self {
        self.init_options = Some(options);
        self
    }

    /// Sets the result artifact path.
    pub fn with_filename(mut self, filename: impl Into<PathBuf>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Sets the seed.
    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Adds a job-specific parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Builds a spec from a JSON object, routing reserved keys to their fields.
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Secondary models required by the initialization strategy.
    ///
    /// Only `model_init` and `multimodel` load premodels; `premodel` may be a
    /// single path or a list of paths.
    pub fn premodels(&self) -> Vec<PathBuf> {
        let uses_premodel = self
            .init
            .as_deref()
            .is_some_and(|init| PREMODEL_INITS.contains(&init));
        if !uses_premodel {
            return Vec::new();
        }

        match self.init_options.as_ref().and_then(|o| o.get("premodel")) {
            Some(Value::String(path)) => vec![PathBuf::from(path)],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(PathBuf::from)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Every artifact source this job needs compiled before it can run.
    pub fn artifact_sources(&self) -> Vec<PathBuf> {
        let mut sources: Vec<PathBuf> = self.model.iter().cloned().collect();
        sources.extend(self.premodels());
        sources
    }

    /// The job parameters flattened into ledger columns.
    ///
    /// Object-valued parameters and paths are stringified so every column
    /// holds a scalar.
    pub fn columns(&self) -> BTreeMap<String, Value> {
        let mut columns: BTreeMap<String, Value> = self
            .extra
            .iter()
            .map(|(key, value)| (key.clone(), scalarize(value)))
            .collect();

        if let Some(model) = &self.model {
            columns.insert("model".into(), path_value(model));
        }
        if let Some(init) = &self.init {
            columns.insert("init".into(), Value::String(init.clone()));
        }
        if let Some(options) = &self.init_options {
            columns.insert(
                "initoptions".into(),
                Value::String(Value::Object(options.clone()).to_string()),
            );
        }
        if let Some(filename) = &self.filename {
            columns.insert("filename".into(), path_value(filename));
        }
        if let Some(seed) = self.seed {
            columns.insert("seed".into(), Value::from(seed));
        }

        columns
    }
}

fn path_value(path: &Path) -> Value {
    Value::String(path.to_string_lossy().into_owned())
}

fn scalarize(value: &Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
        other => other.clone(),
    }
}

/// A queued unit of work: which work function to run, with which parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Name of the registered work function.
    pub function: String,
    /// Parameters passed to the work function.
    pub spec: JobSpec,
}

impl Job {
    /// Creates a new job.
    pub fn new(function: impl Into<String>, spec: JobSpec) -> Self {
        Self {
            function: function.into(),
            spec,
        }
    }
}

/// Identity of a duration group: the function plus every non-diagnostic column.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey(Vec<(String, String)>);

impl GroupKey {
    /// Derives the group of a job from its function and flattened columns.
    pub fn from_columns(function: &str, columns: &BTreeMap<String, Value>) -> Self {
        let mut parts = vec![("function".to_string(), function.to_string())];
        parts.extend(
            columns
                .iter()
                .filter(|(key, _)| !DIAGNOSTIC_COLUMNS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.to_string())),
        );
        Self(parts)
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{}", parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_routes_reserved_fields() {
        let spec = JobSpec::from_json(json!({
            "model": "models/pmf.stan",
            "init": "model_init",
            "initoptions": {"premodel": "models/pre.stan"},
            "filename": "out/run_seed-1.h5",
            "seed": 1,
            "components": 4,
            "delta": 0.8
        }))
        .unwrap();

        assert_eq!(spec.model, Some(PathBuf::from("models/pmf.stan")));
        assert_eq!(spec.init.as_deref(), Some("model_init"));
        assert_eq!(spec.seed, Some(1));
        assert_eq!(spec.extra.len(), 2);
        assert_eq!(spec.extra["components"], json!(4));
    }

    #[test]
    fn test_premodels_single_and_list() {
        let mut options = serde_json::Map::new();
        options.insert("premodel".into(), json!("pre.stan"));
        let single = JobSpec::new()
            .with_init("model_init")
            .with_init_options(options);
        assert_eq!(single.premodels(), vec![PathBuf::from("pre.stan")]);

        let mut options = serde_json::Map::new();
        options.insert("premodel".into(), json!(["a.stan", "b.stan"]));
        let multi = JobSpec::new()
            .with_init("multimodel")
            .with_init_options(options);
        assert_eq!(
            multi.premodels(),
            vec![PathBuf::from("a.stan"), PathBuf::from("b.stan")]
        );
    }

    #[test]
    fn test_premodels_ignored_for_other_inits() {
        let mut options = serde_json::Map::new();
        options.insert("premodel".into(), json!("pre.stan"));
        let spec = JobSpec::new()
            .with_model("m.stan")
            .with_init("nmf_init")
            .with_init_options(options);

        assert!(spec.premodels().is_empty());
        assert_eq!(spec.artifact_sources(), vec![PathBuf::from("m.stan")]);
    }

    #[test]
    fn test_columns_stringify_composites() {
        let mut options = serde_json::Map::new();
        options.insert("samples".into(), json!(10));
        let spec = JobSpec::new()
            .with_filename("out/a.h5")
            .with_init_options(options)
            .with_param("extract", json!(["tau", "F"]))
            .with_param("iterations", 1000);

        let columns = spec.columns();
        assert_eq!(columns["filename"], json!("out/a.h5"));
        assert_eq!(columns["initoptions"], json!("{\"samples\":10}"));
        assert_eq!(columns["extract"], json!("[\"tau\",\"F\"]"));
        assert_eq!(columns["iterations"], json!(1000));
    }

    #[test]
    fn test_group_key_ignores_diagnostics() {
        let a = Job::new(
            "run",
            JobSpec::new()
                .with_seed(1)
                .with_filename("a.h5")
                .with_param("components", 3),
        );
        let b = Job::new(
            "run",
            JobSpec::new()
                .with_seed(2)
                .with_filename("b.h5")
                .with_param("components", 3),
        );
        let c = Job::new("run", JobSpec::new().with_seed(1).with_param("components", 4));
        let d = Job::new(
            "other",
            JobSpec::new().with_seed(1).with_param("components", 3),
        );

        let group = |job: &Job| GroupKey::from_columns(&job.function, &job.spec.columns());
        assert_eq!(group(&a), group(&b));
        assert_ne!(group(&a), group(&c));
        assert_ne!(group(&a), group(&d));
    }

    #[test]
    fn test_job_serialization_keeps_wire_names() {
        let job = Job::new("run", JobSpec::new().with_init_options(serde_json::Map::new()));
        let json = serde_json::to_value(&job).unwrap();
        assert!(json["spec"].get("initoptions").is_some());
        assert!(json["spec"].get("init_options").is_none());
    }
}
