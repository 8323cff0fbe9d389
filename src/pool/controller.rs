//! The process pool controller.
//!
//! Admits queued jobs FIFO up to the concurrency ceiling, waits on child
//! exits with a bounded timeout, and after every wait reaps finished jobs and
//! kills the ones that ran past the absolute ceiling or far past the mean
//! duration of their group. All bookkeeping goes through the [`Ledger`],
//! which is persisted after every cycle.

use std::collections::BTreeMap;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::process::Child;
use tracing::{debug, error, info, warn};

use super::config::PoolConfig;
use super::detector::{absolute_overruns, stuck_overruns, Overrun};
use super::launcher::Launcher;
use crate::error::PoolError;
use crate::jobs::Job;
use crate::ledger::{write_ledger, JobStatus, Ledger};
use crate::precompile::Precompiler;

/// Outcome of one `execute` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSummary {
    /// Number of queued jobs.
    pub total: usize,
    /// Number of jobs per final status.
    pub status_counts: BTreeMap<String, usize>,
    /// Largest number of jobs that ran at once.
    pub peak_active: usize,
    /// Wall-clock time of the run.
    pub elapsed: Duration,
}

impl ExecutionSummary {
    /// Number of jobs that ended with `status`.
    pub fn count(&self, status: JobStatus) -> usize {
        self.status_counts
            .get(&status.to_string())
            .copied()
            .unwrap_or(0)
    }
}

/// Bounded-concurrency process pool with timeout detection.
pub struct PoolController {
    config: PoolConfig,
    launcher: Arc<dyn Launcher>,
    precompiler: Option<Precompiler>,
    ledger: Ledger,
    active: BTreeMap<usize, Child>,
    peak_active: usize,
}

impl PoolController {
    /// Creates a controller launching jobs through `launcher`.
    pub fn new(config: PoolConfig, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            config,
            launcher,
            precompiler: None,
            ledger: Ledger::default(),
            active: BTreeMap::new(),
            peak_active: 0,
        }
    }

    /// Precompiles shared artifacts before each run.
    pub fn with_precompiler(mut self, precompiler: Precompiler) -> Self {
        self.precompiler = Some(precompiler);
        self
    }

    /// The ledger of the current or most recent run.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Runs `jobs` with the timeouts from the configuration.
    pub async fn run(&mut self, jobs: Vec<Job>) -> Result<ExecutionSummary, PoolError> {
        let absolute_timeout = self.config.absolute_timeout;
        let check_interval = self.config.check_interval;
        self.execute(jobs, absolute_timeout, check_interval).await
    }

    /// Runs every job in `jobs` to a terminal state.
    ///
    /// Configuration and precompilation errors abort before anything spawns.
    /// Once jobs are admitted, shutdown always runs: leftover processes are
    /// killed and the ledger is persisted even if the loop fails.
    pub async fn execute(
        &mut self,
        jobs: Vec<Job>,
        absolute_timeout: Duration,
        check_interval: Duration,
    ) -> Result<ExecutionSummary, PoolError> {
        let config = PoolConfig {
            absolute_timeout,
            check_interval,
            ..self.config.clone()
        };
        config.validate()?;
        self.launcher.validate(&jobs)?;
        self.config = config;

        if let Some(precompiler) = self.precompiler.as_mut() {
            precompiler.prepare(&jobs).await?;
        }

        self.ledger = Ledger::from_jobs(&jobs);
        self.active.clear();
        self.peak_active = 0;

        info!(
            jobs = jobs.len(),
            max_processes = self.config.max_processes,
            slack_factor = self.config.slack_factor,
            absolute_timeout_secs = absolute_timeout.as_secs_f64(),
            check_interval_secs = check_interval.as_secs_f64(),
            "Starting pool"
        );

        let started = Instant::now();
        let result = self.run_queue(&jobs).await;
        let status_counts = self.shutdown().await;
        result?;

        Ok(ExecutionSummary {
            total: jobs.len(),
            status_counts,
            peak_active: self.peak_active,
            elapsed: started.elapsed(),
        })
    }

    async fn run_queue(&mut self, jobs: &[Job]) -> Result<(), PoolError> {
        let check_interval = self.config.check_interval;

        for (slot, job) in jobs.iter().enumerate() {
            while self.active.len() >= self.config.max_processes {
                self.wait(check_interval).await?;
            }
            self.spawn(slot, job)?;
        }

        while !self.active.is_empty() {
            self.wait(check_interval).await?;
        }

        Ok(())
    }

    /// Starts the job in `slot`. A launch failure is recorded, not returned.
    fn spawn(&mut self, slot: usize, job: &Job) -> Result<(), PoolError> {
        let now = Utc::now();
        match self.launcher.launch(slot, job) {
            Ok(child) => {
                self.ledger.mark_started(slot, now)?;
                self.active.insert(slot, child);
                self.peak_active = self.peak_active.max(self.active.len());
                info!(
                    slot = slot,
                    function = %job.function,
                    active = self.active.len(),
                    "Started job"
                );
            }
            Err(e) => {
                self.ledger.mark_spawn_failed(slot, now)?;
                error!(slot = slot, function = %job.function, error = %e, "Failed to spawn job");
            }
        }
        Ok(())
    }

    /// Blocks until some job exits or `timeout` elapses, then reaps and
    /// persists the ledger.
    async fn wait(&mut self, timeout: Duration) -> Result<(), PoolError> {
        if self.active.is_empty() {
            return Ok(());
        }

        let any_exit =
            futures::future::select_all(self.active.values_mut().map(|child| Box::pin(child.wait())));
        if tokio::time::timeout(timeout, any_exit).await.is_err() {
            debug!(active = self.active.len(), "No job exited within check interval");
        }

        tokio::time::sleep(self.config.grace_period).await;

        let mut done = Vec::new();
        for (&slot, child) in self.active.iter_mut() {
            match child.try_wait() {
                Ok(Some(status)) => done.push((slot, exit_code(status))),
                Ok(None) => {}
                Err(e) => warn!(slot = slot, error = %e, "Failed to poll job process"),
            }
        }

        self.reap(done).await?;
        self.checkpoint();
        Ok(())
    }

    /// Records exited jobs, then runs the absolute and stuck sweeps.
    async fn reap(&mut self, done: Vec<(usize, i32)>) -> Result<(), PoolError> {
        let now = Utc::now();
        for (slot, code) in done {
            if self.active.remove(&slot).is_none() {
                continue;
            }
            let status = self.ledger.mark_exited(slot, code, now)?;
            let duration_secs = self.ledger.row(slot).and_then(|row| row.duration);
            if status == JobStatus::Finished {
                info!(slot = slot, duration_secs = ?duration_secs, "Job finished");
            } else {
                warn!(slot = slot, status = %status, "Job failed");
            }
        }

        let overdue = absolute_overruns(
            &self.ledger,
            self.active.keys().copied(),
            self.config.absolute_timeout,
            Utc::now(),
        );
        self.kill_all(overdue, JobStatus::Timeout).await?;

        if !self.active.is_empty() {
            let stuck = stuck_overruns(
                &self.ledger,
                self.active.keys().copied(),
                self.config.slack_factor,
                Utc::now(),
            );
            self.kill_all(stuck, JobStatus::ChainTimeout).await?;
        }

        Ok(())
    }

    /// Kills every overrun job, waits one grace period, and records `status`.
    async fn kill_all(&mut self, overruns: Vec<Overrun>, status: JobStatus) -> Result<(), PoolError> {
        let mut killed = Vec::with_capacity(overruns.len());
        for overrun in overruns {
            let Some(child) = self.active.get_mut(&overrun.slot) else {
                continue;
            };
            if let Err(e) = child.start_kill() {
                debug!(slot = overrun.slot, error = %e, "Kill failed, process already gone");
            }
            killed.push(overrun);
        }

        if killed.is_empty() {
            return Ok(());
        }

        let killed_at = Utc::now();
        tokio::time::sleep(self.config.grace_period).await;

        for overrun in killed {
            if let Some(mut child) = self.active.remove(&overrun.slot) {
                if let Err(e) = child.try_wait() {
                    debug!(slot = overrun.slot, error = %e, "Failed to collect killed process");
                }
                self.ledger.mark_killed(overrun.slot, status, killed_at)?;
                warn!(
                    slot = overrun.slot,
                    status = %status,
                    elapsed_secs = overrun.elapsed_secs,
                    limit_secs = overrun.limit_secs,
                    "Killed job"
                );
            }
        }

        Ok(())
    }

    /// Kills leftovers, persists the ledger and logs the status histogram.
    async fn shutdown(&mut self) -> BTreeMap<String, usize> {
        if !self.active.is_empty() {
            warn!(count = self.active.len(), "Killing jobs still running at shutdown");
            for (&slot, child) in self.active.iter_mut() {
                if let Err(e) = child.start_kill() {
                    debug!(slot = slot, error = %e, "Kill failed, process already gone");
                }
            }

            let killed_at = Utc::now();
            tokio::time::sleep(self.config.grace_period).await;

            for (slot, mut child) in std::mem::take(&mut self.active) {
                if let Err(e) = child.try_wait() {
                    debug!(slot = slot, error = %e, "Failed to collect killed process");
                }
                if let Err(e) = self.ledger.mark_killed(slot, JobStatus::Timeout, killed_at) {
                    error!(slot = slot, error = %e, "Failed to record killed job");
                }
            }
        }

        self.checkpoint();

        let counts = self.ledger.status_counts();
        for (status, count) in &counts {
            info!(status = %status, count = count, "Final job status");
        }
        counts
    }

    fn checkpoint(&self) {
        let Some(path) = &self.config.ledger_path else {
            return;
        };
        match write_ledger(&self.ledger, path) {
            Ok(()) => debug!(path = %path.display(), "Ledger persisted"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to persist ledger"),
        }
    }
}

/// Exit code of a process; death by signal `N` maps to `-N`.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}
