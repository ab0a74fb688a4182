//! mash - tag inference engine for directory-based objects
//!
//! Loads a ruleset from one or more rules directories, evaluates a
//! batch of object directories against it, and writes the results
//! back: updated tag files, an `#errors` tag, a `mash.log` report per
//! object, a spill file of per-object records, and an optional CSV.

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, ValueEnum};
use mash_engine::config::{
    DEFAULT_BATCH_SIZE, DEFAULT_IO_CHANNELS, DEFAULT_STEP_CAP, DEFAULT_WORKER_THREADS,
};
use mash_engine::{csv_export, EngineConfig, RuleRegistry};
use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceMode {
    /// Object paths are positional arguments
    Args,
    /// Object paths are read from stdin, one per line
    Stdin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Parser, Debug)]
#[command(
    name = "mash",
    about = "Tag inference engine for directory-based objects",
    version
)]
struct Cli {
    /// Where the object list comes from
    #[arg(long, value_enum, default_value_t = SourceMode::Args)]
    source: SourceMode,

    /// Rules directory (repeatable); rules files start with '#'
    #[arg(long = "rules", value_name = "DIR")]
    rules: Vec<PathBuf>,

    /// Write changed tags, #errors and mash.log back to each object
    #[arg(long = "write-results", value_enum, default_value_t = Toggle::On)]
    write_results: Toggle,

    /// Also export a CSV (one row per object) to this path
    #[arg(long = "csv-out", value_name = "PATH")]
    csv_out: Option<PathBuf>,

    /// Spill file for per-object result records
    #[arg(long, value_name = "PATH", default_value = "mash_results.jsonl")]
    spill: PathBuf,

    /// Max worker threads for evaluation
    #[arg(long, default_value_t = DEFAULT_WORKER_THREADS)]
    threads: usize,

    /// Max concurrent tag file reads
    #[arg(long = "io-channels", default_value_t = DEFAULT_IO_CHANNELS)]
    io_channels: usize,

    /// Max objects held in memory at once
    #[arg(long = "batch-size", default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Evaluation step cap before a NonConvergence error
    #[arg(long = "step-cap", default_value_t = DEFAULT_STEP_CAP)]
    step_cap: usize,

    /// Verbose logging (debug to stderr)
    #[arg(short, long)]
    verbose: bool,

    /// Object directories to evaluate
    #[arg(value_name = "OBJECT")]
    objects: Vec<PathBuf>,
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "mash=debug,mash_engine=debug"
    } else {
        "mash=info,mash_engine=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn gather_objects(cli: &Cli) -> Result<Vec<PathBuf>> {
    match cli.source {
        SourceMode::Args => Ok(cli.objects.clone()),
        SourceMode::Stdin => {
            if !cli.objects.is_empty() {
                bail!("positional objects and --source stdin are mutually exclusive");
            }
            let mut objects = Vec::new();
            for line in std::io::stdin().lock().lines() {
                let line = line.context("Failed to read object list from stdin")?;
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    objects.push(PathBuf::from(trimmed));
                }
            }
            Ok(objects)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if cli.rules.is_empty() {
        bail!("at least one --rules directory is required");
    }

    let mut registry = RuleRegistry::new();
    for dir in &cli.rules {
        let recovered = mash_engine::load_rules_dir(&mut registry, dir)
            .with_context(|| format!("Failed to load rules from {}", dir.display()))?;
        for error in recovered {
            warn!("{}", error);
        }
    }
    info!(rules = registry.len(), "Ruleset loaded");

    let objects = gather_objects(&cli)?;
    if objects.is_empty() {
        bail!("no objects given (pass object directories, or use --source stdin)");
    }

    let config = EngineConfig {
        worker_threads: cli.threads.max(1),
        io_channels: cli.io_channels.max(1),
        batch_size: cli.batch_size.max(1),
        step_cap: cli.step_cap.max(1),
    };

    let summary = mash_engine::run_batch(
        &registry,
        &objects,
        &config,
        cli.write_results == Toggle::On,
        &cli.spill,
    )?;

    if let Some(csv_path) = &cli.csv_out {
        csv_export::export_csv(&cli.spill, csv_path)
            .with_context(|| format!("Failed to write CSV to {}", csv_path.display()))?;
    }

    println!(
        "{} object(s) evaluated, {} with errors, {} tag(s) changed in {} ms",
        summary.objects, summary.objects_with_errors, summary.tags_changed, summary.duration_ms
    );
    Ok(())
}

fn main() -> ExitCode {
    // A bare `?` shows usage, same as -h/--help
    if std::env::args().skip(1).any(|arg| arg == "?") {
        let _ = Cli::command().print_help();
        println!();
        return ExitCode::SUCCESS;
    }

    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(1)
        }
    }
}
