//! batchflow: command-line tool for inspecting and maintaining batches.
//!
//! Reads `DATABASE_URL` (or `--database-url`) and talks to the same tables the
//! batch scheduler writes.

use std::process::ExitCode;

use anyhow::Context;
use batchflow_core::{
    BatchItem, BatchRecord, BatchStatus, BatchStore, ItemStatus, ItemStatusCounts,
    ListBatchesRequest,
};
use batchflow_db::{Database, PoolConfig};
use batchflow_jobs::{BatchScheduler, SchedulerBuilder, SchedulerConfig};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "batchflow")]
#[command(author, version, about = "Inspect and maintain batchflow batches")]
#[command(propagate_version = true)]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a batch record and its item counts
    Status {
        /// Batch id
        batch_id: Uuid,
    },

    /// List the items of a batch in processing order
    Items {
        /// Batch id
        batch_id: Uuid,

        /// Only items in this status (queued, processing, completed, failed, skipped)
        #[arg(short, long)]
        status: Option<ItemStatus>,
    },

    /// List batches, newest first
    List {
        /// Only batches in this status (queued, processing, completed, failed)
        #[arg(short, long)]
        status: Option<BatchStatus>,

        /// Only batches with this type tag
        #[arg(short = 't', long = "type")]
        batch_type: Option<String>,

        /// Maximum number of batches
        #[arg(short, long, default_value_t = 50)]
        limit: i64,

        /// Number of batches to skip
        #[arg(short, long, default_value_t = 0)]
        offset: i64,
    },

    /// Recompute a batch's progress from its items and close it if all are done
    Reconcile {
        /// Batch id
        batch_id: Uuid,
    },

    /// Apply pending database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = init_tracing();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Install the tracing subscriber.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables daily rotated file logging)
///   RUST_LOG    - standard env filter (default: "batchflow=info")
///
/// Console logs go to stderr so command output on stdout stays parseable.
fn init_tracing() -> Option<WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "batchflow=info,batchflow_jobs=info,batchflow_db=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    if let Some(ref path) = log_file {
        let path = std::path::Path::new(path);
        let file_dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("batchflow.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false),
                )
                .init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
        None
    }
}

async fn connect(database_url: Option<&str>) -> anyhow::Result<Database> {
    let url = database_url.context("DATABASE_URL is not set (use --database-url)")?;
    let pool = PoolConfig::from_env().with_workers(SchedulerConfig::from_env().concurrency);
    let db = Database::connect_with_config(url, pool)
        .await
        .context("Failed to connect to database")?;
    info!(subsystem = "cli", op = "connect", "Connected to database");
    Ok(db)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let db = connect(cli.database_url.as_deref()).await?;
    let scheduler = SchedulerBuilder::from_database(&db).build();

    match cli.command {
        Commands::Status { batch_id } => cmd_status(&db, &scheduler, batch_id, cli.json).await,
        Commands::Items { batch_id, status } => {
            cmd_items(&scheduler, batch_id, status, cli.json).await
        }
        Commands::List {
            status,
            batch_type,
            limit,
            offset,
        } => {
            let req = ListBatchesRequest {
                status,
                batch_type,
                limit: Some(limit),
                offset: Some(offset),
            };
            cmd_list(&scheduler, req, cli.json).await
        }
        Commands::Reconcile { batch_id } => cmd_reconcile(&scheduler, batch_id, cli.json).await,
        Commands::Migrate => cmd_migrate(&db).await,
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

async fn cmd_status(
    db: &Database,
    scheduler: &BatchScheduler,
    batch_id: Uuid,
    json: bool,
) -> anyhow::Result<()> {
    let record = scheduler.get_batch(batch_id).await?;
    let counts = db.batches.query_item_status_counts(batch_id).await?;

    if json {
        let out = serde_json::json!({ "batch": record, "items": counts });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    print_record(&record);
    print_counts(&counts);
    Ok(())
}

async fn cmd_items(
    scheduler: &BatchScheduler,
    batch_id: Uuid,
    status: Option<ItemStatus>,
    json: bool,
) -> anyhow::Result<()> {
    let items: Vec<BatchItem> = scheduler
        .get_batch_items(batch_id)
        .await?
        .into_iter()
        .filter(|item| status.map_or(true, |s| item.status == s))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("No items");
        return Ok(());
    }
    println!(
        "{:>5}  {:<10}  {:>8}  {:<12}  LABEL",
        "ORDER", "STATUS", "ATTEMPTS", "STAGE"
    );
    for item in &items {
        println!(
            "{:>5}  {:<10}  {:>8}  {:<12}  {}",
            item.processing_order,
            item.status,
            item.attempts,
            item.stage.as_deref().unwrap_or("-"),
            item.label
        );
        if let Some(err) = &item.error_message {
            println!("{:>5}  {}", "", err);
        }
    }
    Ok(())
}

async fn cmd_list(
    scheduler: &BatchScheduler,
    req: ListBatchesRequest,
    json: bool,
) -> anyhow::Result<()> {
    let records = scheduler.list_batches(req).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No batches");
        return Ok(());
    }
    println!(
        "{:<36}  {:<10}  {:>9}  {:<20}  CREATED",
        "ID", "STATUS", "PROGRESS", "TYPE"
    );
    for record in &records {
        println!(
            "{:<36}  {:<10}  {:>9}  {:<20}  {}",
            record.id,
            record.status,
            format!("{}/{}", record.processed_items, record.total_items),
            record.batch_type,
            record.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn cmd_reconcile(
    scheduler: &BatchScheduler,
    batch_id: Uuid,
    json: bool,
) -> anyhow::Result<()> {
    let before = scheduler.get_batch(batch_id).await?;
    let after = scheduler.reconcile(batch_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&after)?);
        return Ok(());
    }

    if before == after {
        println!("Batch {} already consistent", batch_id);
    } else {
        println!(
            "Batch {}: {} {}/{} -> {} {}/{}",
            batch_id,
            before.status,
            before.processed_items,
            before.total_items,
            after.status,
            after.processed_items,
            after.total_items
        );
    }
    Ok(())
}

async fn cmd_migrate(db: &Database) -> anyhow::Result<()> {
    db.migrate().await.context("Failed to run migrations")?;
    println!("Migrations applied");
    Ok(())
}

// =============================================================================
// OUTPUT
// =============================================================================

fn print_record(record: &BatchRecord) {
    println!("Batch:       {}", record.id);
    println!("Name:        {}", record.name);
    if let Some(description) = &record.description {
        println!("Description: {}", description);
    }
    println!("Type:        {}", record.batch_type);
    println!("Status:      {}", record.status);
    println!(
        "Progress:    {}/{} ({}%)",
        record.processed_items,
        record.total_items,
        record.percent_complete()
    );
    println!("Priority:    {}", record.priority);
    println!("Created:     {}", record.created_at.to_rfc3339());
    if let Some(completed_at) = record.completed_at {
        println!("Completed:   {}", completed_at.to_rfc3339());
    }
    if let Some(err) = &record.error_message {
        println!("Error:       {}", err);
    }
}

fn print_counts(counts: &ItemStatusCounts) {
    println!(
        "Items:       {} queued, {} processing, {} completed, {} failed, {} skipped",
        counts.queued, counts.processing, counts.completed, counts.failed, counts.skipped
    );
}
