//! Command-line interface for fitpool.
//!
//! Provides the `run` command, which drives a job queue through the pool
//! controller, and the `ledger` command for inspecting a persisted ledger.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands, LedgerArgs, RunArgs};
