//! Expansion of an experiment options file into the job queue.
//!
//! The options file is a JSON object with a `general` section shared by every
//! experiment and one section per experiment. Array-valued options (except
//! `extract`) are axes: one job is produced per element of their cartesian
//! product, each with its own result filename.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, info};

use super::spec::JobSpec;
use crate::error::OptionsError;

/// Extension of the result artifacts written by the work functions.
pub const RESULT_EXTENSION: &str = "h5";

/// Options whose values are paths; they are named by file stem.
const PATH_OPTIONS: [&str; 4] = ["datafile", "model", "restriction", "outputbase"];

/// Options that are never an axis even when array-valued.
const LIST_VALUED_OPTIONS: [&str; 1] = ["extract"];

/// Reads `path` and expands it into job specs, in file order.
pub fn load_options(path: &Path, output_base: &Path) -> Result<Vec<JobSpec>, OptionsError> {
    let raw = std::fs::read_to_string(path).map_err(|source| OptionsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let document: Value = serde_json::from_str(&raw)?;
    let specs = expand_options(&document, output_base)?;

    info!(
        path = %path.display(),
        jobs = specs.len(),
        "Expanded job options"
    );

    Ok(specs)
}

/// Expands a parsed options document into job specs.
pub fn expand_options(document: &Value, output_base: &Path) -> Result<Vec<JobSpec>, OptionsError> {
    let sections = document
        .as_object()
        .ok_or_else(|| OptionsError::InvalidExperiment("<root>".into()))?;
    let general = sections
        .get("general")
        .and_then(Value::as_object)
        .ok_or(OptionsError::MissingGeneral)?;

    let mut specs = Vec::new();
    for (experiment, section) in sections.iter().filter(|(name, _)| *name != "general") {
        let own = section
            .as_object()
            .ok_or_else(|| OptionsError::InvalidExperiment(experiment.clone()))?;

        let mut merged = general.clone();
        for (key, value) in own {
            merged.insert(key.clone(), value.clone());
        }

        let before = specs.len();
        expand_experiment(experiment, merged, &output_base.join(experiment), &mut specs)?;
        debug!(
            experiment = %experiment,
            jobs = specs.len() - before,
            "Expanded experiment"
        );
    }

    Ok(specs)
}

fn expand_experiment(
    experiment: &str,
    merged: Map<String, Value>,
    output_dir: &Path,
    specs: &mut Vec<JobSpec>,
) -> Result<(), OptionsError> {
    let axes: Vec<(String, Vec<Value>)> = merged
        .iter()
        .filter(|(key, _)| !LIST_VALUED_OPTIONS.contains(&key.as_str()))
        .filter_map(|(key, value)| value.as_array().map(|items| (key.clone(), items.clone())))
        .collect();

    if axes.is_empty() {
        specs.push(JobSpec::from_json(Value::Object(merged))?);
        return Ok(());
    }

    // An empty axis produces no combinations.
    if axes.iter().any(|(_, values)| values.is_empty()) {
        return Ok(());
    }

    let mut indices = vec![0usize; axes.len()];
    loop {
        let mut options = merged.clone();
        let mut chosen = Vec::with_capacity(axes.len());
        for ((key, values), &index) in axes.iter().zip(&indices) {
            options.insert(key.clone(), values[index].clone());
            chosen.push((key.as_str(), &values[index], index));
        }

        let filename = output_dir.join(result_name(experiment, &chosen));
        options.insert(
            "filename".into(),
            Value::String(filename.to_string_lossy().into_owned()),
        );
        options.remove("outputbase");
        specs.push(JobSpec::from_json(Value::Object(options))?);

        // Odometer increment, last axis fastest.
        let mut axis = axes.len();
        loop {
            if axis == 0 {
                return Ok(());
            }
            axis -= 1;
            indices[axis] += 1;
            if indices[axis] < axes[axis].1.len() {
                break;
            }
            indices[axis] = 0;
        }
    }
}

/// Builds `<experiment>_<k-v>..._<pathkey>-<stem>.h5` for one combination.
fn result_name(experiment: &str, chosen: &[(&str, &Value, usize)]) -> String {
    let plain: Vec<String> = chosen
        .iter()
        .filter(|(key, value, _)| !PATH_OPTIONS.contains(key) && !value.is_object() && *key != "initoptions")
        .map(|(key, value, _)| format!("{}-{}", key, display_value(value)))
        .collect();

    let mut name = format!("{}_{}", experiment, plain.join("_"));

    for (key, value, _) in chosen.iter().filter(|(key, _, _)| PATH_OPTIONS.contains(key)) {
        let stem = value
            .as_str()
            .and_then(|s| Path::new(s).file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| display_value(value));
        name.push_str(&format!("_{}-{}", key, stem));
    }

    if let Some((_, _, index)) = chosen.iter().find(|(key, _, _)| *key == "initoptions") {
        name.push_str(&format!("_initoptions-{}", index));
    }

    format!("{}.{}", name, RESULT_EXTENSION)
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Default directory for result artifacts, derived from the ledger path.
///
/// `runs/fit_info.parquet` becomes `runs/fit`.
pub fn default_output_base(ledger_path: &Path) -> PathBuf {
    let stem = ledger_path
        .file_stem()
        .map(|s| s.to_string_lossy().replace("_info", ""))
        .unwrap_or_default();
    ledger_path.with_file_name(stem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_experiment_without_axes_passes_through() {
        let doc = json!({
            "general": {"model": "m.stan", "iterations": 100},
            "baseline": {"iterations": 200, "extract": ["tau", "F"]}
        });

        let specs = expand_options(&doc, Path::new("out")).unwrap();

        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].extra["iterations"], json!(200));
        assert_eq!(specs[0].extra["extract"], json!(["tau", "F"]));
        assert!(specs[0].filename.is_none());
    }

    #[test]
    fn test_cartesian_product_and_names() {
        let doc = json!({
            "general": {"model": "models/pmf.stan", "outputbase": "ignored"},
            "sweep": {
                "components": [3, 4],
                "seed": [1, 2, 3],
                "datafile": ["data/a.h5"]
            }
        });

        let specs = expand_options(&doc, Path::new("out")).unwrap();

        assert_eq!(specs.len(), 6);
        // Path axes are appended after the plain ones.
        assert_eq!(
            specs[0].filename,
            Some(PathBuf::from(
                "out/sweep/sweep_components-3_seed-1_datafile-a.h5"
            ))
        );
        assert_eq!(specs[1].seed, Some(2));
        assert_eq!(specs[3].extra["components"], json!(4));
        assert!(specs.iter().all(|s| !s.extra.contains_key("outputbase")));
    }

    #[test]
    fn test_initoptions_axis_named_by_index() {
        let doc = json!({
            "general": {},
            "inits": {
                "init": "model_init",
                "initoptions": [{"premodel": "a.stan"}, {"premodel": "b.stan"}]
            }
        });

        let specs = expand_options(&doc, Path::new("out")).unwrap();

        assert_eq!(specs.len(), 2);
        assert_eq!(
            specs[1].filename,
            Some(PathBuf::from("out/inits/inits__initoptions-1.h5"))
        );
        assert_eq!(specs[1].premodels(), vec![PathBuf::from("b.stan")]);
    }

    #[test]
    fn test_missing_general_is_rejected() {
        let doc = json!({"only": {"seed": 1}});
        assert!(matches!(
            expand_options(&doc, Path::new("out")),
            Err(OptionsError::MissingGeneral)
        ));
    }

    #[test]
    fn test_default_output_base() {
        assert_eq!(
            default_output_base(Path::new("runs/fit_info.parquet")),
            PathBuf::from("runs/fit")
        );
    }

    #[test]
    fn test_load_options_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("opts.json");
        std::fs::write(&path, r#"{"general": {"seed": [1, 2]}, "ex": {}}"#).unwrap();

        let specs = load_options(&path, dir.path()).unwrap();
        assert_eq!(specs.len(), 2);
    }
}
