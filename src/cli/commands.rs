//! CLI command definitions for the sentinel.
//!
//! The binary hosts the monitoring side of the system: it restores the queue,
//! runs the health, recovery, snapshot and backup loops, and offers one-shot
//! commands to inspect stored state.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::config::SentinelConfig;
use crate::metrics::export_metrics;
use crate::queue::{FileStore, QueueSnapshot, QueueStorage, Task, TaskPriority};
use crate::sentinel::Sentinel;

/// Resilient task-processing sentinel for content pipelines.
#[derive(Parser)]
#[command(name = "sentinel")]
#[command(about = "Run and inspect the pipeline sentinel")]
#[command(version)]
#[command(
    long_about = "sentinel keeps a content pipeline's task queue durable and healthy.\n\nIt restores queued work from storage, polls component health, runs cooldown-gated recovery actions and raises alerts on sustained failure.\n\nExample usage:\n  sentinel run --storage-dir ./storage/queue\n  sentinel check --pretty"
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
    /// Start the sentinel and run until Ctrl-C.
    Run(RunArgs),

    /// Run one health check and print the snapshot as JSON.
    Check(CheckArgs),

    /// Print statistics about the stored queue and its backups.
    Inspect(InspectArgs),

    /// Run one health check and print metrics in Prometheus text format.
    Metrics(StorageArgs),
}

/// Storage location shared by every command.
#[derive(Parser, Debug, Clone)]
pub struct StorageArgs {
    /// Directory holding the queue snapshot and backups.
    #[arg(long, env = "SENTINEL_STORAGE_DIR")]
    pub storage_dir: Option<PathBuf>,
}

/// Arguments for `sentinel run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub storage: StorageArgs,

    /// Health poll interval in seconds.
    #[arg(long)]
    pub health_interval: Option<u64>,

    /// Recovery scan interval in seconds.
    #[arg(long)]
    pub recovery_interval: Option<u64>,
}

/// Arguments for `sentinel check`.
#[derive(Parser, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    pub storage: StorageArgs,

    /// Pretty-print the JSON output.
    #[arg(long)]
    pub pretty: bool,
}

/// Arguments for `sentinel inspect`.
#[derive(Parser, Debug)]
pub struct InspectArgs {
    #[command(flatten)]
    pub storage: StorageArgs,

    /// Verify every backup and report its status.
    #[arg(long)]
    pub verify_backups: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI arguments and run the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_sentinel_command(args).await,
        Commands::Check(args) => run_check_command(args).await,
        Commands::Inspect(args) => run_inspect_command(args).await,
        Commands::Metrics(args) => run_metrics_command(args).await,
    }
}

fn load_config(storage: &StorageArgs) -> anyhow::Result<SentinelConfig> {
    let mut config = SentinelConfig::from_env()?;
    if let Some(dir) = &storage.storage_dir {
        config.storage_dir = dir.clone();
    }
    Ok(config)
}

async fn run_sentinel_command(args: RunArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.storage)?;
    if let Some(secs) = args.health_interval {
        config.health_interval = std::time::Duration::from_secs(secs);
    }
    if let Some(secs) = args.recovery_interval {
        config.recovery_interval = std::time::Duration::from_secs(secs);
    }

    let mut sentinel = Sentinel::builder(config).build().await?;
    let first = sentinel.start().await?;
    info!(
        status = %first.status,
        storage_dir = %sentinel.config().storage_dir.display(),
        pending = sentinel.queue().stats().depth,
        "Sentinel running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    let snapshot = sentinel.shutdown().await?;
    println!(
        "Stopped with {} pending and {} in-flight tasks persisted",
        snapshot.pending.len(),
        snapshot.in_flight.len()
    );
    Ok(())
}

async fn run_check_command(args: CheckArgs) -> anyhow::Result<()> {
    let config = load_config(&args.storage)?;
    let sentinel = Sentinel::builder(config).build().await?;
    let snapshot = sentinel.health().check_health().await;

    let output = if args.pretty {
        serde_json::to_string_pretty(snapshot.as_ref())?
    } else {
        serde_json::to_string(snapshot.as_ref())?
    };
    println!("{}", output);
    Ok(())
}

async fn run_metrics_command(args: StorageArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    let sentinel = Sentinel::builder(config).build().await?;
    sentinel.health().check_health().await;
    print!("{}", export_metrics());
    Ok(())
}

/// Summary of the stored queue printed by `inspect`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StoredQueueReport {
    storage_dir: String,
    pending: usize,
    in_flight: usize,
    by_priority: BTreeMap<TaskPriority, usize>,
    by_type: BTreeMap<String, usize>,
    retrying: usize,
    oldest_created_at: Option<DateTime<Utc>>,
    backups: Vec<BackupReport>,
}

#[derive(Debug, Serialize)]
struct BackupReport {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    valid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl StoredQueueReport {
    fn new(storage_dir: String, snapshot: &QueueSnapshot, backups: Vec<BackupReport>) -> Self {
        let all: Vec<&Task> = snapshot.pending.iter().chain(&snapshot.in_flight).collect();

        let mut by_priority = BTreeMap::new();
        let mut by_type = BTreeMap::new();
        for task in &all {
            *by_priority.entry(task.priority).or_insert(0) += 1;
            *by_type.entry(task.task_type.clone()).or_insert(0) += 1;
        }

        Self {
            storage_dir,
            pending: snapshot.pending.len(),
            in_flight: snapshot.in_flight.len(),
            by_priority,
            by_type,
            retrying: snapshot
                .pending
                .iter()
                .filter(|t| t.status == crate::queue::TaskStatus::Retrying)
                .count(),
            oldest_created_at: all.iter().map(|t| t.created_at).min(),
            backups,
        }
    }
}

async fn run_inspect_command(args: InspectArgs) -> anyhow::Result<()> {
    let config = load_config(&args.storage)?;
    let storage = QueueStorage::new(
        Arc::new(FileStore::new(config.storage_dir.clone())),
        config.max_backups,
    );

    let snapshot = storage.load_snapshot().await?;
    let mut backups = Vec::new();
    for name in storage.list_backups().await? {
        let report = if args.verify_backups {
            match storage.load_backup(&name).await {
                Ok(_) => BackupReport {
                    name,
                    valid: Some(true),
                    error: None,
                },
                Err(e) => BackupReport {
                    name,
                    valid: Some(false),
                    error: Some(e.to_string()),
                },
            }
        } else {
            BackupReport {
                name,
                valid: None,
                error: None,
            }
        };
        backups.push(report);
    }

    let report = StoredQueueReport::new(
        config.storage_dir.display().to_string(),
        &snapshot,
        backups,
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{EnqueueOptions, TaskQueue};
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_check_args() {
        let cli = Cli::try_parse_from(["sentinel", "check", "--pretty", "--storage-dir", "/tmp/q"])
            .expect("parse");
        match cli.command {
            Commands::Check(args) => {
                assert!(args.pretty);
                assert_eq!(args.storage.storage_dir, Some(PathBuf::from("/tmp/q")));
            }
            _ => panic!("expected check"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_stored_queue_report_counts() {
        let queue = TaskQueue::default();
        queue
            .enqueue(
                "publish",
                serde_json::Value::Null,
                EnqueueOptions::new().with_priority(TaskPriority::High),
            )
            .expect("enqueue");
        queue
            .enqueue("transform", serde_json::Value::Null, EnqueueOptions::new())
            .expect("enqueue");
        queue.dequeue_next().expect("dequeue");

        let report = StoredQueueReport::new("dir".to_string(), &queue.snapshot(), Vec::new());
        assert_eq!(report.pending, 1);
        assert_eq!(report.in_flight, 1);
        assert_eq!(report.by_priority.get(&TaskPriority::High), Some(&1));
        assert_eq!(report.by_type.get("transform"), Some(&1));
        assert!(report.oldest_created_at.is_some());
    }
}
