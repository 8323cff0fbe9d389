//! Job queue construction.
//!
//! - **JobSpec / Job**: typed parameter sets and the work function they run
//! - **GroupKey**: pooling key for duration baselines
//! - **options**: expansion of experiment option files into the queue

pub mod options;
pub mod spec;

pub use options::{default_output_base, expand_options, load_options, RESULT_EXTENSION};
pub use spec::{GroupKey, Job, JobSpec, DIAGNOSTIC_COLUMNS, LEDGER_COLUMNS};
