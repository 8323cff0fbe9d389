//! Bad-job detection over the ledger.
//!
//! Both judges are pure: they read the ledger and a timestamp and return the
//! slots to kill. Killing is left to the controller.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::ledger::Ledger;

/// A running job that exceeded its limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Overrun {
    /// Slot of the job.
    pub slot: usize,
    /// Seconds the job has been running.
    pub elapsed_secs: f64,
    /// The limit it exceeded, in seconds.
    pub limit_secs: f64,
}

/// Active jobs that have run for at least `timeout`.
pub fn absolute_overruns(
    ledger: &Ledger,
    active: impl IntoIterator<Item = usize>,
    timeout: Duration,
    now: DateTime<Utc>,
) -> Vec<Overrun> {
    let limit_secs = timeout.as_secs_f64();
    active
        .into_iter()
        .filter_map(|slot| {
            let elapsed_secs = ledger.row(slot)?.elapsed_secs(now)?;
            (elapsed_secs >= limit_secs).then_some(Overrun {
                slot,
                elapsed_secs,
                limit_secs,
            })
        })
        .collect()
}

/// Active jobs running longer than `slack_factor` times the mean duration of
/// the finished jobs in their group.
///
/// Jobs whose group has no finished job yet are never reported.
pub fn stuck_overruns(
    ledger: &Ledger,
    active: impl IntoIterator<Item = usize>,
    slack_factor: f64,
    now: DateTime<Utc>,
) -> Vec<Overrun> {
    let means = ledger.group_mean_durations();
    active
        .into_iter()
        .filter_map(|slot| {
            let row = ledger.row(slot)?;
            let mean = means.get(&row.group)?;
            let elapsed_secs = row.elapsed_secs(now)?;
            let limit_secs = slack_factor * mean;
            (elapsed_secs > limit_secs).then_some(Overrun {
                slot,
                elapsed_secs,
                limit_secs,
            })
        })
        .collect()
}
