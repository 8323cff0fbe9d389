//! Ledger rows and the per-job status state machine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::jobs::{GroupKey, Job};

/// Lifecycle state of one job.
///
/// `Undefined → Started → {Finished | Exited | Timeout | ChainTimeout}`, or
/// `Undefined → SpawnFailed` when the process could not be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Queued, not yet spawned.
    Undefined,
    /// Process is running.
    Started,
    /// Process exited with code 0.
    Finished,
    /// Process exited with a nonzero code (negative for a fatal signal).
    Exited(i32),
    /// Killed for exceeding the absolute per-job ceiling.
    Timeout,
    /// Killed for exceeding the slack-scaled mean duration of its group.
    ChainTimeout,
    /// The OS refused to create the process.
    SpawnFailed,
}

impl JobStatus {
    /// Returns whether no further transition is allowed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Undefined | JobStatus::Started)
    }

    /// Maps a process exit code onto the ledger state.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            JobStatus::Finished
        } else {
            JobStatus::Exited(code)
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Undefined => write!(f, "undefined"),
            JobStatus::Started => write!(f, "started"),
            JobStatus::Finished => write!(f, "finished"),
            JobStatus::Exited(code) => write!(f, "{}", code),
            JobStatus::Timeout => write!(f, "timeout"),
            JobStatus::ChainTimeout => write!(f, "chain timeout"),
            JobStatus::SpawnFailed => write!(f, "spawn failed"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "undefined" => Ok(JobStatus::Undefined),
            "started" => Ok(JobStatus::Started),
            "finished" => Ok(JobStatus::Finished),
            "timeout" => Ok(JobStatus::Timeout),
            "chain timeout" => Ok(JobStatus::ChainTimeout),
            "spawn failed" => Ok(JobStatus::SpawnFailed),
            other => other
                .parse::<i32>()
                .map(JobStatus::Exited)
                .map_err(|_| format!("Unknown job status: {}", other)),
        }
    }
}

/// Bookkeeping for one queued job.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRow {
    /// Queue position of the job.
    pub slot: usize,
    /// Work function name.
    pub function: String,
    /// The job spec flattened into scalar columns.
    pub params: BTreeMap<String, Value>,
    /// Duration group of the job.
    pub group: GroupKey,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// When the process was spawned.
    pub start: Option<DateTime<Utc>>,
    /// When the process finished or was killed.
    pub stop: Option<DateTime<Utc>>,
    /// Wall-clock seconds, only for `Finished` rows.
    pub duration: Option<f64>,
}

impl LedgerRow {
    /// Creates the `undefined` row of a queued job.
    pub fn new(slot: usize, job: &Job) -> Self {
        let params = job.spec.columns();
        let group = GroupKey::from_columns(&job.function, &params);
        Self {
            slot,
            function: job.function.clone(),
            params,
            group,
            status: JobStatus::Undefined,
            start: None,
            stop: None,
            duration: None,
        }
    }

    /// Seconds since the job started, as seen at `now`.
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> Option<f64> {
        self.start.map(|start| seconds_between(start, now))
    }
}

/// Number of jobs per status text.
pub fn status_histogram(statuses: impl IntoIterator<Item = JobStatus>) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for status in statuses {
        *counts.entry(status.to_string()).or_insert(0) += 1;
    }
    counts
}

/// Signed seconds from `from` to `to`, with microsecond resolution.
pub(crate) fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    delta
        .num_microseconds()
        .map(|us| us as f64 / 1_000_000.0)
        .unwrap_or_else(|| delta.num_milliseconds() as f64 / 1_000.0)
}
