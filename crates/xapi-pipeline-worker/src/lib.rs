//! Long-running workers that move xAPI statements from the event log into
//! the normalized store, plus the `xapi-pipeline` command surface.
//!
//! Embedders can drive the workers directly through [`PipelineContext`],
//! [`StreamConsumer`] and [`RecoveryScanner`], or run a parsed [`Cli`] with
//! [`run_cli`].

#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod consumer;
pub mod context;
pub mod logging;
pub mod pipeline;
pub mod recovery;
pub mod scheduler;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use xapi_pipeline_core::now_utc;
use xapi_pipeline_store_sqlite::{PendingSummary, StoreCounts};

pub use config::{ConfigError, PipelineConfig};
pub use consumer::{ConsumerSettings, ConsumerState, ConsumerTotals, CycleReport, StreamConsumer};
pub use context::PipelineContext;
pub use pipeline::{process_entries, BatchReport, ItemFailure, ItemOutcome, ProcessedEntry};
pub use recovery::{RecoveryScanner, ScanReport};
pub use scheduler::{run_periodic, Backoff, ShutdownSignal};

#[derive(Debug, Parser)]
#[command(name = "xapi-pipeline")]
#[command(about = "xAPI statement normalization pipeline")]
pub struct Cli {
    /// Statement store database.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Event log database. Defaults to the store database.
    #[arg(long = "log-db")]
    log_db: Option<PathBuf>,

    /// JSON config file. Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    group: Option<String>,

    #[arg(long)]
    stream: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create or upgrade the store schema.
    Migrate,
    /// Append statements from a JSON array or JSON-lines file to the log.
    Publish(PublishArgs),
    /// Run the stream consumer.
    Consume(ConsumeArgs),
    /// Run one recovery scan over the trailing window.
    Recover(RecoverArgs),
    /// Run consumers and the recovery scanner until interrupted.
    Run,
    /// Report store row counts and group progress.
    Status(StatusArgs),
    /// List dead-lettered log entries.
    DeadLetters(DeadLettersArgs),
}

#[derive(Debug, Args)]
pub struct PublishArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct ConsumeArgs {
    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,
    #[arg(long)]
    consumer: Option<String>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    block_ms: Option<u64>,
}

#[derive(Debug, Args)]
pub struct RecoverArgs {
    #[arg(long)]
    lookback_secs: Option<u64>,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct DeadLettersArgs {
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct StatusReport {
    pub db: String,
    pub log_db: String,
    pub counts: StoreCounts,
    pub group: PendingSummary,
}

pub fn run_cli(cli: Cli) -> Result<()> {
    logging::init_tracing(&cli.log_level)?;
    let config = resolve_config(&cli)?;

    match cli.command {
        Command::Migrate => {
            let context = PipelineContext::open(config)?;
            let counts = context.store().counts()?;
            print_json(&json!({
                "migrated": true,
                "db": context.config().db_path.display().to_string(),
                "counts": counts,
            }))?;
            context.close();
            Ok(())
        }
        Command::Publish(args) => run_publish(config, &args),
        Command::Consume(args) => run_consume(config, args),
        Command::Recover(args) => {
            let mut config = config;
            if let Some(lookback) = args.lookback_secs {
                config.recovery_lookback_secs = lookback;
            }
            let context = PipelineContext::open(config)?;
            let report = RecoveryScanner::new(&context).scan_window(now_utc())?;
            print_json(&report)?;
            context.close();
            Ok(())
        }
        Command::Run => run_workers(config),
        Command::Status(args) => {
            let context = PipelineContext::inspect(config)?;
            let report = StatusReport {
                db: context.config().db_path.display().to_string(),
                log_db: context.config().log_path().display().to_string(),
                counts: context.store().counts()?,
                group: context.log().pending(&context.config().group)?,
            };
            if args.json {
                print_json(&report)?;
            } else {
                print_status(&report);
            }
            context.close();
            Ok(())
        }
        Command::DeadLetters(args) => {
            let context = PipelineContext::inspect(config)?;
            let letters = context.store().list_dead_letters(args.limit)?;
            print_json(&letters)?;
            context.close();
            Ok(())
        }
    }
}

fn resolve_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.db_path.clone_from(db);
    }
    if let Some(log_db) = &cli.log_db {
        config.log_path = Some(log_db.clone());
    }
    if let Some(group) = &cli.group {
        config.group.clone_from(group);
    }
    if let Some(stream) = &cli.stream {
        config.stream.clone_from(stream);
    }
    Ok(config)
}

fn run_publish(config: PipelineConfig, args: &PublishArgs) -> Result<()> {
    let payloads = read_payloads(&args.file)?;
    let context = PipelineContext::open(config)?;

    let mut first_entry_id = None;
    let mut last_entry_id = None;
    for payload in &payloads {
        let entry = context.log().append(payload)?;
        if first_entry_id.is_none() {
            first_entry_id = Some(entry.id);
        }
        last_entry_id = Some(entry.id);
    }

    tracing::info!(published = payloads.len(), stream = context.log().stream(), "statements published");
    print_json(&json!({
        "stream": context.log().stream(),
        "published": payloads.len(),
        "first_entry_id": first_entry_id,
        "last_entry_id": last_entry_id,
    }))?;
    context.close();
    Ok(())
}

/// Reads statements as a JSON array or as one JSON document per line. Each
/// element is published as-is; validation happens when it is consumed.
fn read_payloads(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read statements from {}", path.display()))?;

    if raw.trim_start().starts_with('[') {
        let values: Vec<Value> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse JSON array in {}", path.display()))?;
        return values
            .iter()
            .map(|value| serde_json::to_string(value).context("failed to serialize statement"))
            .collect();
    }

    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn run_consume(mut config: PipelineConfig, args: ConsumeArgs) -> Result<()> {
    if let Some(consumer) = args.consumer {
        config.consumer = consumer;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(block_ms) = args.block_ms {
        config.block_ms = block_ms;
    }

    let context = PipelineContext::open(config)?;
    let mut consumer = StreamConsumer::new(&context, context.config().consumer.clone());

    if args.once {
        let report = consumer.run_cycle()?;
        print_json(&report)?;
    } else {
        let shutdown = install_shutdown_handler()?;
        let totals = consumer.run(&shutdown);
        print_json(&totals)?;
    }

    context.close();
    Ok(())
}

fn run_workers(config: PipelineConfig) -> Result<()> {
    let context = Arc::new(PipelineContext::open(config)?);
    let shutdown = install_shutdown_handler()?;
    let consumers = context.config().consumers;

    let mut consumer_handles = Vec::with_capacity(consumers);
    for index in 0..consumers {
        let name = if consumers == 1 {
            context.config().consumer.clone()
        } else {
            format!("{}-{index}", context.config().consumer)
        };
        let worker_context = Arc::clone(&context);
        let worker_shutdown = shutdown.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || StreamConsumer::new(&worker_context, name).run(&worker_shutdown))
            .context("failed to spawn consumer thread")?;
        consumer_handles.push(handle);
    }

    let scanner_context = Arc::clone(&context);
    let scanner_shutdown = shutdown.clone();
    let scanner_handle = thread::Builder::new()
        .name("recovery-scanner".to_string())
        .spawn(move || RecoveryScanner::new(&scanner_context).run(&scanner_shutdown))
        .context("failed to spawn recovery scanner thread")?;

    tracing::info!(consumers, "pipeline running; press Ctrl-C to stop");

    let mut totals = Vec::with_capacity(consumers);
    for handle in consumer_handles {
        totals.push(
            handle
                .join()
                .map_err(|_| anyhow!("consumer thread panicked"))?,
        );
    }
    let recovery_runs = scanner_handle
        .join()
        .map_err(|_| anyhow!("recovery scanner thread panicked"))?;

    print_json(&json!({
        "consumers": totals,
        "recovery_runs": recovery_runs,
    }))?;

    match Arc::try_unwrap(context) {
        Ok(context) => context.close(),
        Err(_) => tracing::warn!("pipeline context still shared at shutdown"),
    }
    Ok(())
}

fn install_shutdown_handler() -> Result<ShutdownSignal> {
    let shutdown = ShutdownSignal::new();
    let handler_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("shutdown requested; finishing in-flight batches");
        handler_signal.trigger();
    })
    .context("failed to install Ctrl-C handler")?;
    Ok(shutdown)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_status(report: &StatusReport) {
    println!("db={} log_db={}", report.db, report.log_db);
    println!(
        "raw_events={} actors={} activities={} verbs={} facts={} dead_letters={}",
        report.counts.raw_events,
        report.counts.actors,
        report.counts.activities,
        report.counts.verbs,
        report.counts.facts,
        report.counts.dead_letters
    );
    println!(
        "stream={} group={} pending={} oldest_pending_id={} max_delivery_count={} last_delivered_id={} undelivered={}",
        report.group.stream,
        report.group.group,
        report.group.pending,
        report
            .group
            .oldest_pending_id
            .map_or_else(|| "n/a".to_string(), |id| id.to_string()),
        report.group.max_delivery_count,
        report.group.last_delivered_id,
        report.group.undelivered
    );
}
