//! The run ledger: one row per queued job.
//!
//! The ledger is the single source of truth for scheduling decisions and the
//! audit trail read by post-processing. It consists of:
//!
//! - **LedgerRow / JobStatus**: per-job bookkeeping and its state machine
//! - **Ledger**: the in-memory table owned by the pool controller
//! - **store**: Parquet snapshots written on every checkpoint
//!
//! # Usage
//!
//! ```rust,ignore
//! use fitpool::ledger::{read_ledger, JobStatus};
//!
//! let records = read_ledger(Path::new("runs/fit_info.parquet"))?;
//! let finished: Vec<_> = records
//!     .iter()
//!     .filter(|r| r.status == JobStatus::Finished)
//!     .collect();
//! ```

pub mod row;
pub mod store;
pub mod table;

pub use row::{status_histogram, JobStatus, LedgerRow};
pub use store::{read_ledger, rows_to_record_batch, write_ledger, LedgerRecord};
pub use table::Ledger;
