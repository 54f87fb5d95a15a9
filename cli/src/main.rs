use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use keel_kernel::adapters::jsonl::JsonlEventSource;
use keel_kernel::apply::JsonLinesApplier;
use keel_kernel::checkpoint::{CheckpointStore, FileCheckpointStore};
use keel_kernel::config::{FailurePolicy, RunConfig, RunMode};
use keel_kernel::replay::Engine;
use keel_kernel::run::run;

/// Keel event processor CLI
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(version, about = "Exactly-once event ingestion with crash-safe checkpoints", long_about = None)]
struct Cli {
    /// Log filter (trace, debug, info, warn, error, or an EnvFilter directive)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply every new event in the log, checkpointing after each one
    Run(RunArgs),

    /// Print a summary of a checkpoint file
    Inspect {
        /// Path to checkpoint JSON
        #[arg(long)]
        checkpoint: PathBuf,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Path to run config JSON; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the JSONL event log
    #[arg(long)]
    log: Option<PathBuf>,

    /// Path to the checkpoint file
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Delay between polls in continuous mode
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Stop a continuous run after this many polls
    #[arg(long)]
    max_polls: Option<u64>,

    #[arg(long, value_enum)]
    on_apply_failure: Option<FailureArg>,

    /// How long a checkpoint write may block before it counts as failed
    #[arg(long)]
    checkpoint_timeout_ms: Option<u64>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Bounded,
    Continuous,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Bounded => RunMode::Bounded,
            ModeArg::Continuous => RunMode::Continuous,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FailureArg {
    /// Stop at the failed event and exit non-zero
    Halt,
    /// Log the failure and move on; the event is retried next run
    Continue,
}

impl From<FailureArg> for FailurePolicy {
    fn from(arg: FailureArg) -> Self {
        match arg {
            FailureArg::Halt => FailurePolicy::Halt,
            FailureArg::Continue => FailurePolicy::LogAndContinue,
        }
    }
}

/// Checkpoint summary for `keel inspect`
#[derive(Debug, Serialize)]
struct InspectOutput {
    path: PathBuf,
    applied: u64,
    high_water_mark: Option<u64>,
    ranges: Vec<(u64, u64)>,
    keys: Vec<String>,
    updated_at: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    match cli.command {
        Commands::Run(args) => run_command(&args),
        Commands::Inspect { checkpoint } => inspect_command(checkpoint),
    }
}

fn resolve_config(args: &RunArgs) -> Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let data = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            RunConfig::from_json(&data)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => RunConfig::default(),
    };

    if let Some(log) = &args.log {
        config.event_log = log.clone();
    }
    if let Some(checkpoint) = &args.checkpoint {
        config.checkpoint = checkpoint.clone();
    }
    if let Some(mode) = args.mode {
        config.mode = mode.into();
    }
    if let Some(ms) = args.poll_interval_ms {
        config.poll_interval_ms = ms;
    }
    if let Some(polls) = args.max_polls {
        config.max_polls = Some(polls);
    }
    if let Some(policy) = args.on_apply_failure {
        config.on_apply_failure = policy.into();
    }
    if let Some(ms) = args.checkpoint_timeout_ms {
        config.checkpoint_timeout_ms = ms;
    }

    Ok(config)
}

fn run_command(args: &RunArgs) -> Result<()> {
    let config = resolve_config(args)?;

    let store =
        FileCheckpointStore::new(&config.checkpoint).with_write_timeout(config.checkpoint_timeout());
    let applier = JsonLinesApplier::new(io::stdout());
    let mut engine = Engine::open(store, applier, config.on_apply_failure)
        .with_context(|| format!("cannot start from checkpoint {}", config.checkpoint.display()))?;
    let mut source = JsonlEventSource::new(&config.event_log);

    let report = run(&mut source, &mut engine, &config)?;

    // stdout carries the applied events; the summary goes to stderr.
    eprintln!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

fn inspect_command(path: PathBuf) -> Result<()> {
    let store = FileCheckpointStore::new(path);
    let checkpoint = store.load()?;

    let output = InspectOutput {
        applied: checkpoint.applied,
        high_water_mark: checkpoint.high_water_mark(),
        updated_at: checkpoint.updated_at.map(|t| t.to_rfc3339()),
        ranges: checkpoint.ranges,
        keys: checkpoint.keys,
        path: store.path().to_path_buf(),
    };

    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
