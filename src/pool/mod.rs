//! Bounded-concurrency process pool.
//!
//! This module provides:
//!
//! - **PoolController**: admits jobs FIFO, reaps exits and kills bad jobs
//! - **detector**: absolute-timeout and stuck-job judges over the ledger
//! - **Launcher / CommandLauncher**: turns a queued job into an OS process
//! - **PoolConfig / FileConfig**: tunables and the work function declarations
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fitpool::pool::{CommandLauncher, FileConfig, PoolConfig, PoolController};
//!
//! let file = FileConfig::load(Path::new("fitpool.yaml"))?;
//! let launcher = CommandLauncher::new(file.functions.into());
//! let config = PoolConfig::from_env()?.with_ledger_path("runs/fit_info.parquet");
//!
//! let mut pool = PoolController::new(config, Arc::new(launcher));
//! let summary = pool.run(jobs).await?;
//! ```

pub mod config;
pub mod controller;
pub mod detector;
pub mod launcher;

pub use config::{parse_duration, CompilerSpec, FileConfig, PoolConfig};
pub use controller::{ExecutionSummary, PoolController};
pub use detector::{absolute_overruns, stuck_overruns, Overrun};
pub use launcher::{CommandLauncher, FunctionRegistry, FunctionSpec, Launcher, ENV_PREFIX};
