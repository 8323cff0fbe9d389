//! fitpool: bounded-concurrency process pool for long model-fitting jobs.
//!
//! This library expands experiment option files into a job queue, precompiles
//! the shared artifacts the queue needs, and runs every job as an OS process
//! under a concurrency ceiling while killing jobs that overrun an absolute
//! ceiling or the mean duration of their finished peers. Every job's
//! lifecycle is recorded in a Parquet ledger.

pub mod cli;
pub mod error;
pub mod jobs;
pub mod ledger;
pub mod pool;
pub mod precompile;

// Re-export commonly used types
pub use error::{ConfigError, LedgerError, OptionsError, PoolError, PrecompileError};
pub use jobs::{Job, JobSpec};
pub use ledger::{JobStatus, Ledger};
pub use pool::{ExecutionSummary, PoolConfig, PoolController};
