//! The in-memory run ledger owned by the pool controller.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use super::row::{seconds_between, status_histogram, JobStatus, LedgerRow};
use crate::error::LedgerError;
use crate::jobs::{GroupKey, Job};

/// One row per queued job, indexed by slot.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    rows: Vec<LedgerRow>,
}

impl Ledger {
    /// Materializes the ledger for a queue; every row starts `undefined`.
    pub fn from_jobs(jobs: &[Job]) -> Self {
        Self {
            rows: jobs
                .iter()
                .enumerate()
                .map(|(slot, job)| LedgerRow::new(slot, job))
                .collect(),
        }
    }

    /// All rows in slot order.
    pub fn rows(&self) -> &[LedgerRow] {
        &self.rows
    }

    /// The row of `slot`, if any.
    pub fn row(&self, slot: usize) -> Option<&LedgerRow> {
        self.rows.get(slot)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns whether the ledger has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Records a spawn: `undefined → started`.
    pub fn mark_started(&mut self, slot: usize, now: DateTime<Utc>) -> Result<(), LedgerError> {
        let row = self.transition(slot, JobStatus::Started, |s| s == JobStatus::Undefined)?;
        row.start = Some(now);
        Ok(())
    }

    /// Records a process that could not be created: `undefined → spawn failed`.
    pub fn mark_spawn_failed(&mut self, slot: usize, now: DateTime<Utc>) -> Result<(), LedgerError> {
        let row = self.transition(slot, JobStatus::SpawnFailed, |s| s == JobStatus::Undefined)?;
        row.start = Some(now);
        row.stop = Some(now);
        Ok(())
    }

    /// Records a process exit: `started → finished | <exit code>`.
    ///
    /// `duration` is only set for a clean exit.
    pub fn mark_exited(
        &mut self,
        slot: usize,
        exit_code: i32,
        now: DateTime<Utc>,
    ) -> Result<JobStatus, LedgerError> {
        let status = JobStatus::from_exit_code(exit_code);
        let row = self.transition(slot, status, |s| s == JobStatus::Started)?;
        let stop = stop_time(row, now);
        row.stop = Some(stop);
        if status == JobStatus::Finished {
            row.duration = row.start.map(|start| seconds_between(start, stop));
        }
        Ok(status)
    }

    /// Records a kill: `started → timeout | chain timeout`.
    pub fn mark_killed(
        &mut self,
        slot: usize,
        status: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        if !matches!(status, JobStatus::Timeout | JobStatus::ChainTimeout) {
            return Err(self.invalid(slot, status));
        }
        let row = self.transition(slot, status, |s| s == JobStatus::Started)?;
        row.stop = Some(stop_time(row, now));
        Ok(())
    }

    /// Mean duration of the `finished` rows of every group that has one.
    ///
    /// Computed from the current state on each call.
    pub fn group_mean_durations(&self) -> HashMap<GroupKey, f64> {
        let mut sums: HashMap<&GroupKey, (f64, usize)> = HashMap::new();
        for row in self.rows.iter().filter(|r| r.status == JobStatus::Finished) {
            if let Some(duration) = row.duration {
                let entry = sums.entry(&row.group).or_insert((0.0, 0));
                entry.0 += duration;
                entry.1 += 1;
            }
        }

        sums.into_iter()
            .map(|(group, (sum, count))| (group.clone(), sum / count as f64))
            .collect()
    }

    /// Number of rows per status text.
    pub fn status_counts(&self) -> BTreeMap<String, usize> {
        status_histogram(self.rows.iter().map(|row| row.status))
    }

    /// Returns whether every row reached a terminal state.
    pub fn all_terminal(&self) -> bool {
        self.rows.iter().all(|r| r.status.is_terminal())
    }

    fn transition(
        &mut self,
        slot: usize,
        to: JobStatus,
        allowed_from: impl Fn(JobStatus) -> bool,
    ) -> Result<&mut LedgerRow, LedgerError> {
        let from = self.rows.get(slot).ok_or(LedgerError::UnknownSlot(slot))?.status;
        if !allowed_from(from) {
            return Err(self.invalid(slot, to));
        }
        let row = &mut self.rows[slot];
        row.status = to;
        Ok(row)
    }

    fn invalid(&self, slot: usize, to: JobStatus) -> LedgerError {
        match self.rows.get(slot) {
            Some(row) => LedgerError::InvalidTransition {
                slot,
                from: row.status.to_string(),
                to: to.to_string(),
            },
            None => LedgerError::UnknownSlot(slot),
        }
    }
}

/// Keeps `stop >= start` even if the wall clock stepped backwards.
fn stop_time(row: &LedgerRow, now: DateTime<Utc>) -> DateTime<Utc> {
    match row.start {
        Some(start) if start > now => start,
        _ => now,
    }
}
