use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use labstage::{
    collect_batch, notifications_for, spawn_intake_watcher, BatchProcessor, BatchReport,
    LocalObjectStore, Settings,
};
use labstage_extract::{HttpExtractionService, QueryExecutor};
use labstage_storage::{count_staging_records, create_db, get_pending_staging_records, SqliteStagingStore, StagingWriter};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Exit status when the trigger should be redelivered.
const EXIT_REDELIVER: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "labstage", version, about = "Extract lab values from uploaded documents and stage them for review")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Process an object-created event envelope (JSON file, or `-` for stdin).
    Process { event: PathBuf },
    /// Watch a local bucket directory and process documents as they arrive.
    Watch {
        /// Defaults to `<LABSTAGE_OBJECT_ROOT>/<LABSTAGE_BUCKET>`.
        dir: Option<PathBuf>,
        /// Quiet period that closes a batch.
        #[arg(long, default_value_t = 500)]
        debounce_ms: u64,
        #[arg(long, default_value_t = 32)]
        max_batch: usize,
    },
    /// List staged documents awaiting review.
    Pending {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Print the active query catalogs as TOML.
    Catalog,
}

type Processor = BatchProcessor<LocalObjectStore, HttpExtractionService, SqliteStagingStore>;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env().context("Failed to read configuration")?;

    match cli.command {
        Command::Process { event } => {
            let json = if event.as_os_str() == "-" {
                std::io::read_to_string(std::io::stdin()).context("Failed to read event from stdin")?
            } else {
                tokio::fs::read_to_string(&event)
                    .await
                    .with_context(|| format!("Failed to read event file {}", event.display()))?
            };
            let processor = build_processor(&settings, LocalObjectStore::new(&settings.object_root)).await?;
            let report = processor.process_event(&json).await.context("Failed to parse event")?;
            print_report(&report)?;
            Ok(exit_code(&report))
        }
        Command::Watch { dir, debounce_ms, max_batch } => {
            let (store, bucket) = match dir {
                Some(dir) => {
                    let bucket = dir
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map(str::to_string)
                        .context("Watch directory must be named after its bucket")?;
                    let root = dir.parent().map(PathBuf::from).unwrap_or_default();
                    (LocalObjectStore::new(root), bucket)
                }
                None => (LocalObjectStore::new(&settings.object_root), settings.bucket.clone()),
            };
            let bucket_dir = store.bucket_dir(&bucket);
            std::fs::create_dir_all(&bucket_dir)
                .with_context(|| format!("Failed to create {}", bucket_dir.display()))?;

            let processor = build_processor(&settings, store.clone()).await?;
            let (tx, mut rx) = mpsc::channel::<PathBuf>(256);
            // The watcher must be kept alive for the duration of the loop.
            let _watcher = spawn_intake_watcher(&bucket_dir, tx).context("Failed to start intake watcher")?;
            tracing::info!(dir = %bucket_dir.display(), %bucket, "watching for documents");

            let quiet = Duration::from_millis(debounce_ms);
            loop {
                let paths = tokio::select! {
                    batch = collect_batch(&mut rx, quiet, max_batch) => match batch {
                        Some(paths) => paths,
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("shutting down");
                        break;
                    }
                };
                let notifications = notifications_for(&store, &bucket, &paths);
                if notifications.is_empty() {
                    continue;
                }
                let report = processor.process_batch(notifications).await;
                print_report(&report)?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Pending { limit } => {
            let pool = create_db(&settings.database_path, settings.database_max_connections)
                .await
                .context("Failed to open staging database")?;
            let records = get_pending_staging_records(&pool, limit).await?;
            let total = count_staging_records(&pool).await?;
            for record in &records {
                let counts = record.extraction().map(|r| r.counts());
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    record.created_at.to_rfc3339(),
                    record.locator.location,
                    record.locator.document_type,
                    record.payload.outcome(),
                    counts
                        .map(|c| format!(
                            "normal={} flagged={} suppressed={} missing={}",
                            c.normal, c.flagged, c.suppressed, c.missing
                        ))
                        .unwrap_or_default(),
                );
            }
            eprintln!("{} pending of {} staged", records.len(), total);
            Ok(ExitCode::SUCCESS)
        }
        Command::Catalog => {
            let catalogs = settings.load_catalogs()?;
            print!("{}", catalogs.to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn build_processor(settings: &Settings, objects: LocalObjectStore) -> anyhow::Result<Processor> {
    let catalogs = settings.load_catalogs()?;
    let service = HttpExtractionService::new(
        settings.extraction_endpoint()?,
        settings.extraction_region.clone(),
        settings.extraction_timeout,
    )?;
    let pool = create_db(&settings.database_path, settings.database_max_connections)
        .await
        .with_context(|| format!("Failed to open staging database {}", settings.database_path.display()))?;

    Ok(BatchProcessor::new(
        objects,
        QueryExecutor::new(service, settings.service_retry.clone()),
        StagingWriter::new(SqliteStagingStore::new(pool), settings.store_retry.clone()),
        catalogs,
        settings.thresholds,
        settings.batch_limits(),
    ))
}

fn print_report(report: &BatchReport) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

fn exit_code(report: &BatchReport) -> ExitCode {
    if report.needs_redelivery() {
        ExitCode::from(EXIT_REDELIVER)
    } else {
        ExitCode::SUCCESS
    }
}
