//! End-to-end tests for the pool controller.
//!
//! Every test spawns real `sh` processes, so wall-clock timings are kept in
//! the low seconds and assertions only rely on orderings with wide margins.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fitpool::error::{ConfigError, PoolError, PrecompileError};
use fitpool::jobs::{Job, JobSpec};
use fitpool::ledger::{read_ledger, JobStatus};
use fitpool::pool::{
    CommandLauncher, FunctionRegistry, FunctionSpec, Launcher, PoolConfig, PoolController,
};
use fitpool::precompile::{ArtifactBuilder, Precompiler};
use tempfile::TempDir;
use tokio::process::{Child, Command};

const GRACE: Duration = Duration::from_millis(50);

/// Runs a fixed shell script per slot.
struct ScriptLauncher {
    scripts: Vec<&'static str>,
}

impl Launcher for ScriptLauncher {
    fn validate(&self, _jobs: &[Job]) -> Result<(), ConfigError> {
        Ok(())
    }

    fn launch(&self, slot: usize, _job: &Job) -> std::io::Result<Child> {
        Command::new("sh")
            .arg("-c")
            .arg(self.scripts[slot])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }
}

fn script_pool(config: PoolConfig, scripts: Vec<&'static str>) -> (PoolController, Vec<Job>) {
    let jobs = (0..scripts.len())
        .map(|slot| Job::new("fit", JobSpec::new().with_seed(slot as i64)))
        .collect();
    let pool = PoolController::new(config, Arc::new(ScriptLauncher { scripts }));
    (pool, jobs)
}

fn grouped_jobs(groups: &[&str]) -> Vec<Job> {
    groups
        .iter()
        .enumerate()
        .map(|(slot, group)| {
            Job::new(
                "fit",
                JobSpec::new()
                    .with_seed(slot as i64)
                    .with_param("dataset", *group),
            )
        })
        .collect()
}

#[tokio::test]
async fn test_fifo_admission_respects_ceiling() {
    let config = PoolConfig::new(2).with_grace_period(GRACE);
    let pool_scripts = vec!["sleep 1", "sleep 1", "sleep 2"];
    let (mut pool, _) = script_pool(config, pool_scripts);
    let jobs = grouped_jobs(&["a", "a", "c"]);

    let summary = pool
        .execute(jobs, Duration::from_secs(60), Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(summary.total, 3);
    assert_eq!(summary.count(JobStatus::Finished), 3);
    assert_eq!(summary.peak_active, 2);

    let rows = pool.ledger().rows();
    let earliest_stop = rows[..2].iter().filter_map(|r| r.stop).min().unwrap();
    assert!(rows[2].start.unwrap() >= earliest_stop);
    assert!(rows.iter().all(|r| r.duration.is_some()));
}

#[tokio::test]
async fn test_nonzero_exit_is_recorded() {
    let config = PoolConfig::new(2).with_grace_period(GRACE);
    let (mut pool, jobs) = script_pool(config, vec!["exit 2", "exit 0"]);

    let summary = pool
        .execute(jobs, Duration::from_secs(60), Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(summary.count(JobStatus::Exited(2)), 1);
    assert_eq!(summary.count(JobStatus::Finished), 1);

    let failed = pool.ledger().row(0).unwrap();
    assert_eq!(failed.status.to_string(), "2");
    assert!(failed.duration.is_none());
    assert!(failed.stop.is_some());
}

#[tokio::test]
async fn test_absolute_timeout_kills_job() {
    let config = PoolConfig::new(1).with_grace_period(GRACE);
    let (mut pool, jobs) = script_pool(config, vec!["exec sleep 30"]);
    let timeout = Duration::from_secs(1);

    let summary = pool
        .execute(jobs, timeout, Duration::from_millis(200))
        .await
        .unwrap();

    assert_eq!(summary.count(JobStatus::Timeout), 1);
    assert!(summary.elapsed < Duration::from_secs(10));

    let row = pool.ledger().row(0).unwrap();
    let ran = (row.stop.unwrap() - row.start.unwrap()).to_std().unwrap();
    assert!(ran >= timeout);
    assert!(row.duration.is_none());
}

#[tokio::test]
async fn test_chain_timeout_only_with_finished_peers() {
    let config = PoolConfig::new(4)
        .with_grace_period(GRACE)
        .with_slack_factor(3.0);
    let scripts = vec!["sleep 0.5", "sleep 0.5", "exec sleep 30", "exec sleep 30"];
    let (mut pool, _) = script_pool(config, scripts);
    let jobs = grouped_jobs(&["a", "a", "a", "b"]);
    let absolute = Duration::from_secs(4);

    let summary = pool
        .execute(jobs, absolute, Duration::from_millis(200))
        .await
        .unwrap();

    assert_eq!(summary.count(JobStatus::Finished), 2);
    assert_eq!(summary.count(JobStatus::ChainTimeout), 1);
    assert_eq!(summary.count(JobStatus::Timeout), 1);

    let ledger = pool.ledger();
    let stuck = ledger.row(2).unwrap();
    assert_eq!(stuck.status, JobStatus::ChainTimeout);
    let stuck_ran = (stuck.stop.unwrap() - stuck.start.unwrap()).to_std().unwrap();
    assert!(stuck_ran < absolute);

    let lonely = ledger.row(3).unwrap();
    assert_eq!(lonely.status, JobStatus::Timeout);
    let lonely_ran = (lonely.stop.unwrap() - lonely.start.unwrap()).to_std().unwrap();
    assert!(lonely_ran >= absolute);
}

#[tokio::test]
async fn test_ledger_is_persisted_with_params() {
    let dir = TempDir::new().unwrap();
    let ledger_path = dir.path().join("runs").join("fit_info.parquet");

    let registry = FunctionRegistry::new().with_function(
        "fit",
        FunctionSpec::new(
            "sh",
            vec![
                "-c".into(),
                "sleep \"$FITPOOL_PARAM_SLEEP\"; exit \"$FITPOOL_PARAM_CODE\"".into(),
            ],
        ),
    );
    let config = PoolConfig::new(2)
        .with_grace_period(GRACE)
        .with_ledger_path(&ledger_path)
        .with_absolute_timeout(Duration::from_secs(60))
        .with_check_interval(Duration::from_secs(10));
    let mut pool = PoolController::new(config, Arc::new(CommandLauncher::new(registry)));

    let jobs = vec![
        Job::new("fit", JobSpec::new().with_param("sleep", 0.2).with_param("code", 0)),
        Job::new("fit", JobSpec::new().with_param("sleep", 0.2).with_param("code", 3)),
    ];
    pool.run(jobs).await.unwrap();

    let records = read_ledger(&ledger_path).unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.is_terminal()));
    assert_eq!(records[0].status, JobStatus::Finished);
    assert_eq!(records[1].status, JobStatus::Exited(3));
    assert_eq!(records[1].params["code"], serde_json::json!(3));
    assert_eq!(records[0].function, "fit");
    assert!(!ledger_path.with_extension("parquet.tmp").exists());
}

#[tokio::test]
async fn test_each_run_starts_a_fresh_ledger() {
    let config = PoolConfig::new(1).with_grace_period(GRACE);
    let (mut pool, jobs) = script_pool(config, vec!["exit 0", "exit 0"]);

    pool.run(jobs.clone()).await.unwrap();
    assert_eq!(pool.ledger().len(), 2);

    let summary = pool.run(jobs[..1].to_vec()).await.unwrap();
    assert_eq!(summary.total, 1);
    assert_eq!(pool.ledger().len(), 1);
    assert!(pool.ledger().all_terminal());
}

/// Compiler that always fails.
struct BrokenCompiler;

#[async_trait]
impl ArtifactBuilder for BrokenCompiler {
    async fn build(&self, source: &Path, _output: &Path) -> Result<(), PrecompileError> {
        Err(PrecompileError::BuildFailed {
            source_path: source.to_path_buf(),
            reason: "syntax error".into(),
        })
    }
}

#[tokio::test]
async fn test_precompile_failure_aborts_before_any_spawn() {
    let dir = TempDir::new().unwrap();
    let model = dir.path().join("model.stan");
    std::fs::write(&model, "model {}").unwrap();
    let marker = dir.path().join("ran");

    let registry = FunctionRegistry::new().with_function(
        "fit",
        FunctionSpec::new(
            "sh",
            vec!["-c".into(), "touch \"$FITPOOL_PARAM_MARKER\"".into()],
        ),
    );
    let config = PoolConfig::new(2).with_grace_period(GRACE);
    let mut pool = PoolController::new(config, Arc::new(CommandLauncher::new(registry)))
        .with_precompiler(Precompiler::new(Arc::new(BrokenCompiler)));

    let jobs = vec![Job::new(
        "fit",
        JobSpec::new()
            .with_model(&model)
            .with_param("marker", marker.to_string_lossy().into_owned()),
    )];
    let result = pool.run(jobs).await;

    assert!(matches!(
        result,
        Err(PoolError::Precompile(PrecompileError::BuildFailed { .. }))
    ));
    assert!(!marker.exists());
    assert!(pool.ledger().is_empty());
}

#[tokio::test]
async fn test_ledger_is_checkpointed_while_jobs_run() {
    let dir = TempDir::new().unwrap();
    let ledger_path = dir.path().join("fit_info.parquet");

    let config = PoolConfig::new(4)
        .with_grace_period(GRACE)
        .with_ledger_path(&ledger_path);
    let scripts = vec!["exit 0", "exit 0", "exec sleep 30", "exec sleep 30"];
    let (mut pool, _) = script_pool(config, scripts);
    let jobs = grouped_jobs(&["a", "b", "c", "d"]);

    let snapshot = async {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        read_ledger(&ledger_path).unwrap()
    };
    let (summary, snapshot) = tokio::join!(
        pool.execute(jobs, Duration::from_secs(3), Duration::from_millis(200)),
        snapshot
    );

    let statuses: Vec<JobStatus> = snapshot.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            JobStatus::Finished,
            JobStatus::Finished,
            JobStatus::Started,
            JobStatus::Started
        ]
    );
    assert!(snapshot[0].duration.is_some());
    assert!(snapshot[2].stop.is_none());

    let summary = summary.unwrap();
    assert_eq!(summary.count(JobStatus::Finished), 2);
    assert_eq!(summary.count(JobStatus::Timeout), 2);
    assert!(read_ledger(&ledger_path).unwrap().iter().all(|r| r.is_terminal()));
}
