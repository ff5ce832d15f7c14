//! Sluice CLI - compile and run staged query jobs.
//!
//! A job file names its collections, the logical plan and, optionally, the
//! engine configuration. The CLI explains how the plan is staged, runs it on
//! the local substrate, and inspects the intermediate datasets it leaves
//! behind.

mod commands;
mod output;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Staged query compiler and local runner.
///
/// Reads a JSON job file with `sources`, `plan` and an optional `config`
/// section.
#[derive(Parser)]
#[command(name = "sluice")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(long, global = true, default_value = "table")]
    format: OutputFormat,

    /// Suppress progress and info messages
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Enable verbose debug logging
    #[arg(long, short, global = true)]
    verbose: bool,
}

/// Output format options.
#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    /// Human-readable table format (default for TTY)
    #[default]
    Table,
    /// Machine-readable JSON format
    Json,
}

/// Group-by strategy override.
#[derive(Clone, Copy, ValueEnum)]
enum Grouping {
    /// Sort before the shuffle, group sequentially.
    Sort,
    /// Hash grouping on both sides.
    Hash,
}

/// Content-blind shuffle orders.
#[derive(Clone, Copy, ValueEnum)]
enum Diagnostic {
    /// Every comparison answers "greater".
    Constant,
    /// Comparisons answer at random.
    Random,
}

/// Settings a command line may override in the job's configuration.
#[derive(clap::Args, Default)]
struct Overrides {
    /// JSON configuration file replacing the job's `config` section
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for intermediate datasets
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Job name, used as the dataset name prefix
    #[arg(long)]
    job_name: Option<String>,

    /// Number of reduce partitions for group-by and join shuffles
    #[arg(long)]
    reduce_partitions: Option<usize>,

    /// Group-by strategy
    #[arg(long)]
    grouping: Option<Grouping>,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Show the rewritten plan and its stage graph
    Explain {
        /// Path to the job file
        job: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Compile and run a job, printing its result rows
    Run {
        /// Path to the job file
        job: PathBuf,

        #[command(flatten)]
        overrides: Overrides,

        /// Deliver shuffles in a content-blind order
        #[arg(long)]
        diagnostic_order: Option<Diagnostic>,
    },

    /// Summarize the part files of an intermediate dataset
    Inspect {
        /// Dataset directory or a single part file
        path: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
    } else if !cli.quiet {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_writer(std::io::stderr)
            .init();
    }

    let result = match cli.command {
        Commands::Explain { job, overrides } => {
            commands::explain::run(&job, &overrides, cli.format, cli.quiet)
        }
        Commands::Run {
            job,
            overrides,
            diagnostic_order,
        } => commands::run::run(
            &job,
            &overrides,
            diagnostic_order,
            cli.format,
            cli.quiet,
        ),
        Commands::Inspect { path } => commands::inspect::run(&path, cli.format, cli.quiet),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
