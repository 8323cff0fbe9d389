//! CLI command definitions for fitpool.
//!
//! `fitpool run` expands an options file into a job queue and drives it
//! through the pool controller; `fitpool ledger` summarizes a persisted ledger.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use crate::jobs::{default_output_base, load_options, Job};
use crate::ledger::{read_ledger, status_histogram};
use crate::pool::{
    parse_duration, CommandLauncher, FileConfig, PoolConfig, PoolController,
};
use crate::precompile::{CommandBuilder, Precompiler};

/// Default work function name.
const DEFAULT_FUNCTION: &str = "run";

/// Default configuration file.
const DEFAULT_CONFIG_FILE: &str = "fitpool.yaml";

/// Bounded-concurrency process pool for long model-fitting jobs.
#[derive(Parser)]
#[command(name = "fitpool")]
#[command(about = "Run model-fitting jobs as a bounded process pool with stuck-job detection")]
#[command(version)]
#[command(
    long_about = "fitpool runs a queue of long model-fitting jobs as OS processes under a concurrency ceiling.\n\nJobs exceeding an absolute ceiling, or running far longer than the finished jobs of their group, are killed. Every job's lifecycle is recorded in a Parquet ledger.\n\nExample usage:\n  fitpool run --procs 8 --input experiments.json --ledger runs/fit_info.parquet"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Expand an options file and run every job.
    Run(RunArgs),

    /// Summarize a persisted ledger.
    Ledger(LedgerArgs),
}

/// Arguments for `fitpool run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Maximum number of jobs running at once.
    #[arg(short = 'p', long, env = "FITPOOL_MAX_PROCESSES")]
    pub procs: Option<usize>,

    /// JSON options file with a `general` section and one section per experiment.
    #[arg(short = 'i', long)]
    pub input: PathBuf,

    /// Path of the Parquet ledger.
    #[arg(long, env = "FITPOOL_LEDGER_PATH")]
    pub ledger: PathBuf,

    /// Kill a job after this many times the mean duration of its finished peers.
    #[arg(long)]
    pub wait_n: Option<f64>,

    /// Wall-clock ceiling for a single job (e.g. `7 days`, `12h`).
    #[arg(long, value_parser = parse_duration)]
    pub max_time_per_job: Option<Duration>,

    /// Longest time between timeout sweeps (e.g. `10 min`).
    #[arg(long, value_parser = parse_duration)]
    pub check_interval: Option<Duration>,

    /// Delay between observing an exit or kill and collecting the process.
    #[arg(long, value_parser = parse_duration)]
    pub grace_period: Option<Duration>,

    /// Work function every job runs.
    #[arg(short = 'f', long, default_value = DEFAULT_FUNCTION)]
    pub function: String,

    /// YAML file declaring work functions and the artifact compiler.
    #[arg(short = 'c', long, env = "FITPOOL_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Directory for result artifacts (default: derived from the ledger path).
    #[arg(short = 'o', long)]
    pub output_base: Option<PathBuf>,

    /// Rebuild compiled artifacts even when they are up to date.
    #[arg(long)]
    pub force_rebuild: bool,
}

/// Arguments for `fitpool ledger`.
#[derive(Parser, Debug)]
pub struct LedgerArgs {
    /// Path of the Parquet ledger.
    #[arg(long, env = "FITPOOL_LEDGER_PATH")]
    pub ledger: PathBuf,

    /// Print every row, not only the status histogram.
    #[arg(long)]
    pub rows: bool,
}

/// Parse CLI arguments and return the Cli struct.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with pre-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_pool_command(args).await,
        Commands::Ledger(args) => run_ledger_command(args),
    }
}

/// Builds the pool configuration: environment first, flags on top.
fn pool_config(args: &RunArgs) -> anyhow::Result<PoolConfig> {
    apply_flags(PoolConfig::from_env()?, args)
}

fn apply_flags(base: PoolConfig, args: &RunArgs) -> anyhow::Result<PoolConfig> {
    let mut config = base.with_ledger_path(&args.ledger);

    if let Some(procs) = args.procs {
        config = config.with_max_processes(procs);
    }
    if let Some(wait_n) = args.wait_n {
        config = config.with_slack_factor(wait_n);
    }
    if let Some(timeout) = args.max_time_per_job {
        config = config.with_absolute_timeout(timeout);
    }
    if let Some(interval) = args.check_interval {
        config = config.with_check_interval(interval);
    }
    if let Some(grace) = args.grace_period {
        config = config.with_grace_period(grace);
    }

    config.validate()?;
    Ok(config)
}

async fn run_pool_command(args: RunArgs) -> anyhow::Result<()> {
    let config = pool_config(&args)?;
    let file_config = load_file_config(&args.config)?;

    let output_base = args
        .output_base
        .clone()
        .unwrap_or_else(|| default_output_base(&args.ledger));
    let jobs: Vec<Job> = load_options(&args.input, &output_base)?
        .into_iter()
        .map(|spec| Job::new(args.function.clone(), spec))
        .collect();

    let launcher = CommandLauncher::new(file_config.functions.into());
    let mut controller = PoolController::new(config, Arc::new(launcher));

    match &file_config.compiler {
        Some(compiler) => {
            let builder = CommandBuilder::from_command_line(&compiler.command)?;
            let precompiler = Precompiler::new(Arc::new(builder))
                .with_extension(compiler.extension.clone())
                .with_force(args.force_rebuild);
            controller = controller.with_precompiler(precompiler);
        }
        None => info!("No artifact compiler configured, skipping precompilation"),
    }

    let summary = controller.run(jobs).await?;

    println!("\n=== fitpool run ===");
    println!("Jobs:        {}", summary.total);
    println!("Peak active: {}", summary.peak_active);
    println!("Elapsed:     {:.1}s", summary.elapsed.as_secs_f64());
    println!("Ledger:      {}", args.ledger.display());
    for (status, count) in &summary.status_counts {
        println!("  {:<14} {}", status, count);
    }

    Ok(())
}

fn load_file_config(path: &Path) -> anyhow::Result<FileConfig> {
    let config = FileConfig::load(path)?;
    if config.functions.is_empty() {
        return Err(anyhow::anyhow!(
            "No work functions declared in {}",
            path.display()
        ));
    }
    Ok(config)
}

fn run_ledger_command(args: LedgerArgs) -> anyhow::Result<()> {
    let records = read_ledger(&args.ledger)?;

    let counts = status_histogram(records.iter().map(|record| record.status));

    println!("Ledger {} ({} jobs)", args.ledger.display(), records.len());
    for (status, count) in &counts {
        println!("  {:<14} {}", status, count);
    }

    if args.rows {
        println!();
        for record in &records {
            let duration = record
                .duration
                .map(|d| format!("{:.1}s", d))
                .unwrap_or_else(|| "-".to_string());
            let params: Vec<String> = record
                .params
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect();
            println!(
                "  {:>5} {:<10} {:<14} {:>10}  {}",
                record.slot,
                record.function,
                record.status.to_string(),
                duration,
                params.join(" ")
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let args = vec![
            "fitpool",
            "run",
            "--input",
            "experiments.json",
            "--ledger",
            "runs/fit_info.parquet",
        ];
        let cli = Cli::try_parse_from(args).expect("should parse");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.input, PathBuf::from("experiments.json"));
                assert_eq!(args.function, DEFAULT_FUNCTION);
                assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_FILE));
                assert!(args.wait_n.is_none());
                assert!(!args.force_rebuild);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_command_with_all_options() {
        let args = vec![
            "fitpool",
            "run",
            "-p",
            "8",
            "-i",
            "experiments.json",
            "--ledger",
            "runs/fit_info.parquet",
            "--wait-n",
            "2.5",
            "--max-time-per-job",
            "2 days",
            "--check-interval",
            "5 min",
            "--grace-period",
            "1s",
            "-f",
            "fit",
            "-c",
            "pool.yaml",
            "-o",
            "results",
            "--force-rebuild",
        ];
        let cli = Cli::try_parse_from(args).expect("should parse");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.procs, Some(8));
                assert_eq!(args.wait_n, Some(2.5));
                assert_eq!(args.max_time_per_job, Some(Duration::from_secs(172_800)));
                assert_eq!(args.check_interval, Some(Duration::from_secs(300)));
                assert_eq!(args.grace_period, Some(Duration::from_secs(1)));
                assert_eq!(args.function, "fit");
                assert_eq!(args.output_base, Some(PathBuf::from("results")));
                assert!(args.force_rebuild);

                let config = apply_flags(PoolConfig::default(), &args).unwrap();
                assert_eq!(config.max_processes, 8);
                assert_eq!(config.slack_factor, 2.5);
                assert_eq!(config.absolute_timeout, Duration::from_secs(172_800));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_rejects_bad_duration() {
        let args = vec![
            "fitpool",
            "run",
            "-i",
            "e.json",
            "--ledger",
            "l.parquet",
            "--check-interval",
            "whenever",
        ];
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn test_ledger_command() {
        let args = vec!["fitpool", "ledger", "--ledger", "runs/fit_info.parquet", "--rows"];
        let cli = Cli::try_parse_from(args).expect("should parse");

        match cli.command {
            Commands::Ledger(args) => {
                assert_eq!(args.ledger, PathBuf::from("runs/fit_info.parquet"));
                assert!(args.rows);
            }
            _ => panic!("Expected Ledger command"),
        }
    }
}
