use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobpipe_core::ProcessedJobRecord;
use jobpipe_storage::{PostgresStore, RawJobStore};
use jobpipe_sync::{
    build_cron_scheduler, run_once_from_env, Pipeline, PipelineConfig, SyncOutcome,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "jobpipe")]
#[command(about = "Job posting ingestion, normalization and publishing pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run cycles until interrupted (interval loop, or cron when JOBPIPE_SCHEDULE_CRON is set).
    Run,
    /// Run a single ingest + ETL cycle.
    Once,
    /// Drain one batch of unprocessed records without ingesting.
    Process {
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Push processed jobs from a JSON file (one object or an array) downstream.
    Sync {
        file: PathBuf,
        /// Skip the bus and call the downstream api directly.
        #[arg(long)]
        direct: bool,
    },
    /// List records that exhausted their retry budget.
    Poisoned {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Give poisoned records a fresh retry budget.
    Requeue {
        ids: Vec<Uuid>,
        /// Requeue every poisoned record.
        #[arg(long, conflicts_with = "ids")]
        all: bool,
    },
    /// Create tables and indexes if missing.
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Once) {
        Commands::Run => run(config).await?,
        Commands::Once => {
            let report = run_once_from_env().await?;
            println!(
                "cycle complete: run_id={} fetched={} saved={} rejected={} processed={} failed={} poisoned={}",
                report.run_id,
                report.ingest.fetched,
                report.ingest.saved,
                report.ingest.rejected,
                report.batch.processed(),
                report.batch.failed(),
                report.batch.poisoned()
            );
        }
        Commands::Process { batch_size } => {
            let batch_size = batch_size.unwrap_or(config.batch_size);
            let pipeline = Pipeline::from_config(config).await?;
            let report = pipeline.scheduling.runner().process_pending(batch_size).await;
            pipeline.shutdown().await?;
            let report = report?;
            for record in &report.records {
                println!("{} {} {:?}", record.raw_job_id, record.url, record.outcome);
            }
            println!(
                "batch complete: processed={} skipped={} failed={}",
                report.processed(),
                report.skipped(),
                report.failed()
            );
        }
        Commands::Sync { file, direct } => {
            let jobs = read_jobs(&file).await?;
            let pipeline = Pipeline::from_config(config).await?;
            let mut failures = 0usize;
            for job in &jobs {
                match pipeline.coordinator.sync_job(job, !direct).await {
                    Ok(outcome) => print_outcome(job, &outcome),
                    Err(err) => {
                        failures += 1;
                        warn!(source_url = %job.source_url, error = %err, "sync failed");
                    }
                }
            }
            pipeline.shutdown().await?;
            println!("sync complete: jobs={} failures={failures}", jobs.len());
        }
        Commands::Poisoned { limit } => {
            let store = PostgresStore::connect(&config.database_url).await?;
            for record in store.get_poisoned(limit).await? {
                println!(
                    "{} {} {} attempts={} last_error={}",
                    record.id,
                    record.source,
                    record.url,
                    record.attempts,
                    record.last_error.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Requeue { ids, all } => {
            let store = PostgresStore::connect(&config.database_url).await?;
            let ids = if all {
                store
                    .get_poisoned(usize::MAX)
                    .await?
                    .into_iter()
                    .map(|record| record.id)
                    .collect()
            } else {
                ids
            };
            let mut requeued = 0usize;
            for id in ids {
                if store.requeue(id).await.with_context(|| format!("requeueing {id}"))? {
                    requeued += 1;
                } else {
                    warn!(%id, "record already processed; not requeued");
                }
            }
            println!("requeued {requeued} record(s)");
        }
        Commands::Migrate => {
            let store = PostgresStore::connect(&config.database_url).await?;
            store.ensure_schema().await?;
            println!("schema ready");
        }
    }

    Ok(())
}

async fn run(config: PipelineConfig) -> Result<()> {
    let cron = config.schedule_cron.clone();
    let pipeline = Pipeline::from_config(config).await?;

    if let Some(cron) = cron {
        let mut sched = build_cron_scheduler(Arc::clone(&pipeline.scheduling), &cron).await?;
        sched.start().await.context("starting cron scheduler")?;
        info!(%cron, "cron scheduler running; ctrl-c to stop");
        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        sched.shutdown().await.context("stopping cron scheduler")?;
    } else {
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&pipeline.scheduling).run(shutdown.clone()));
        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        info!("shutdown requested");
        shutdown.cancel();
        handle.await.context("joining scheduling loop")?;
    }

    pipeline.shutdown().await
}

async fn read_jobs(file: &Path) -> Result<Vec<ProcessedJobRecord>> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", file.display()))?;
    let jobs = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    Ok(jobs)
}

fn print_outcome(job: &ProcessedJobRecord, outcome: &SyncOutcome) {
    println!(
        "{} action={:?} path={:?} tracking={}",
        job.source_url,
        outcome.action,
        outcome.path,
        outcome
            .tracking
            .as_ref()
            .map(|t| t.id.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
}
