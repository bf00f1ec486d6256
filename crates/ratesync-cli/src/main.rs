use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ratesync_storage::PgEntityStore;
use ratesync_sync::{build_scheduler, write_report, PassSummary, SyncConfig, SyncPipeline};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ratesync", version)]
#[command(about = "Keep per-entity skill ratings in sync from the live API and bulk event logs")]
struct Cli {
    /// Optional YAML config; environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    batch_size: Option<usize>,
    #[arg(long, global = true)]
    rate_limit_ms: Option<u64>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One live pass over every known identifier, stalest first.
    Sync,
    /// Fetch the given identifiers now, creating any that are new.
    Track {
        #[arg(required = true)]
        identifiers: Vec<String>,
    },
    /// Merge a CSV event log (username,time_control,rating,entry_seq).
    Bulk { file: PathBuf },
    /// Create or extend the destination table.
    Migrate,
    /// Run live passes on the configured cron until interrupted.
    Schedule,
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = SyncConfig::load(cli.config.as_deref())?;
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(ms) = cli.rate_limit_ms {
        config.rate_limit_delay = Duration::from_millis(ms);
    }
    config.validate()?;
    Ok(config)
}

fn print_pass(summary: &PassSummary) {
    println!(
        "pass complete: run_id={} visited={} updated={} not_found={} failed={} batches={} rows_lost={}",
        summary.run_id,
        summary.visited,
        summary.updated,
        summary.not_found,
        summary.failed,
        summary.flush.batches_committed,
        summary.flush.rows_lost
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .try_init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let reports_dir = config.reports_dir.clone();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::connect(config).await?;
            let summary = pipeline.run_live_pass().await?;
            let report = write_report(&reports_dir, summary.run_id, "summary", &summary).await?;
            print_pass(&summary);
            println!("report: {}", report.display());
        }
        Commands::Track { identifiers } => {
            let pipeline = SyncPipeline::connect(config).await?;
            let summary = pipeline.track(&identifiers).await?;
            let report = write_report(&reports_dir, summary.run_id, "summary", &summary).await?;
            print_pass(&summary);
            println!("report: {}", report.display());
        }
        Commands::Bulk { file } => {
            let pipeline = SyncPipeline::connect(config).await?;
            let summary = pipeline.run_bulk_file(&file).await?;
            let report = write_report(&reports_dir, summary.run_id, "summary", &summary).await?;
            println!(
                "bulk complete: run_id={} rows={} retained={} identifiers={} created={} rows_committed={} rows_lost={}",
                summary.run_id,
                summary.input_rows,
                summary.retained_rows,
                summary.identifiers,
                summary.created,
                summary.flush.rows_committed,
                summary.flush.rows_lost
            );
            println!("report: {}", report.display());
        }
        Commands::Migrate => {
            let store = PgEntityStore::connect(&config.database_url, 1)
                .await
                .context("connecting to destination store")?;
            let added = store.ensure_schema().await?;
            if added.is_empty() {
                println!("schema up to date");
            } else {
                println!("added columns: {}", added.join(", "));
            }
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                bail!("scheduler disabled; set RATESYNC_SCHEDULER_ENABLED=true");
            }
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(SyncPipeline::connect(config).await?);
            let Some(mut sched) = build_scheduler(pipeline).await? else {
                bail!("scheduler disabled");
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            if let Err(err) = sched.shutdown().await {
                warn!(error = %err, "scheduler shutdown failed");
            }
        }
    }

    Ok(())
}
