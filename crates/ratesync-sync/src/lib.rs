//! Sync orchestration: live passes over the metric source, bulk event loads,
//! and the batch upsert stage both of them feed.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use ratesync_adapters::{
    FetchContext, FetchFailure, FetchOutcome, MetricSource, PlayerStatsSource,
};
use ratesync_core::{dedup_events, merge_record, EntityRecord, RawEvent};
use ratesync_storage::{EntityStore, HttpFetcher, PgEntityStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod batch;
mod config;
mod pacing;
mod schedule;

pub use batch::{BatchAccumulator, FlushStats, Upserter};
pub use config::{ConfigError, ConfigFile, SyncConfig};
pub use pacing::RateLimiter;
pub use schedule::StalenessScheduler;

pub const CRATE_NAME: &str = "ratesync-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("pass {run_id} aborted after {committed_batches} committed batches: {source}")]
    Aborted {
        run_id: Uuid,
        committed_batches: usize,
        #[source]
        source: StoreError,
    },
    #[error("reading entity snapshot: {0}")]
    Snapshot(#[source] StoreError),
    #[error("staging bulk events: {0}")]
    Staging(#[source] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    /// Every known identifier, stalest first.
    Scheduled,
    /// An explicit identifier list, possibly including unknown ones.
    Tracked,
}

#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub run_id: Uuid,
    pub kind: PassKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub scheduled: usize,
    pub visited: usize,
    pub updated: usize,
    pub not_found: usize,
    pub failed: usize,
    pub flush: FlushStats,
}

impl PassSummary {
    pub fn skipped(&self) -> usize {
        self.not_found + self.failed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub source_sha256: Option<String>,
    pub source_bytes: usize,
    pub input_rows: usize,
    pub unknown_mode_rows: usize,
    pub retained_rows: usize,
    pub identifiers: usize,
    pub created: usize,
    pub flush: FlushStats,
}

#[derive(Debug, Default)]
struct LiveCounts {
    visited: usize,
    updated: usize,
    not_found: usize,
    failed: usize,
}

struct Fetched {
    record: EntityRecord,
    fetched_at: DateTime<Utc>,
    outcome: Result<FetchOutcome, FetchFailure>,
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

pub struct SyncPipeline {
    config: SyncConfig,
    source: Arc<dyn MetricSource>,
    store: Arc<dyn EntityStore>,
    // One pass at a time per process; the store assumes a single writer.
    pass_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn MetricSource>,
        store: Arc<dyn EntityStore>,
    ) -> Self {
        Self {
            config,
            source,
            store,
            pass_lock: Mutex::new(()),
        }
    }

    /// Wire the HTTP stats source and the Postgres store from `config`,
    /// making sure the destination schema is in place.
    pub async fn connect(config: SyncConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let source = PlayerStatsSource::new(http, &config.api_base_url)?;
        let store = PgEntityStore::connect(&config.database_url, 2)
            .await
            .context("connecting to destination store")?;
        let added = store.ensure_schema().await.context("ensuring schema")?;
        if !added.is_empty() {
            info!(columns = ?added, "destination schema extended");
        }
        Ok(Self::new(config, Arc::new(source), Arc::new(store)))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// One scheduled pass over every known identifier.
    pub async fn run_live_pass(&self) -> Result<PassSummary, SyncError> {
        let _guard = self.pass_lock.lock().await;
        let records = self
            .store
            .snapshot_records()
            .await
            .map_err(SyncError::Snapshot)?;
        let scheduler = StalenessScheduler::new(records);
        self.sync_records(PassKind::Scheduled, scheduler.into_iter().collect())
            .await
    }

    /// Fetch and merge an explicit identifier list. Unknown identifiers are
    /// created on their first successful fetch.
    pub async fn track(&self, identifiers: &[String]) -> Result<PassSummary, SyncError> {
        let _guard = self.pass_lock.lock().await;
        let mut seen = HashSet::new();
        let wanted: Vec<String> = identifiers
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();

        let existing: HashMap<String, EntityRecord> = self
            .store
            .load_records(&wanted)
            .await
            .map_err(SyncError::Snapshot)?
            .into_iter()
            .map(|r| (r.identifier.clone(), r))
            .collect();
        let records = wanted
            .into_iter()
            .map(|id| {
                existing
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| EntityRecord::new(id))
            })
            .collect();
        self.sync_records(PassKind::Tracked, records).await
    }

    async fn fetch_one(
        &self,
        limiter: &RateLimiter,
        ctx: &FetchContext,
        deadline: Duration,
        record: EntityRecord,
    ) -> Fetched {
        limiter.pace().await;
        let fetched_at = Utc::now();
        let outcome = match tokio::time::timeout(deadline, self.source.fetch(ctx, &record.identifier)).await {
            Ok(result) => result,
            Err(_) => Err(FetchFailure::Timeout(deadline)),
        };
        Fetched {
            record,
            fetched_at,
            outcome,
        }
    }

    async fn sync_records(
        &self,
        kind: PassKind,
        records: Vec<EntityRecord>,
    ) -> Result<PassSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("live_pass", %run_id, kind = ?kind, source = self.source.source_id());
        self.sync_records_inner(run_id, kind, records)
            .instrument(span)
            .await
    }

    async fn sync_records_inner(
        &self,
        run_id: Uuid,
        kind: PassKind,
        records: Vec<EntityRecord>,
    ) -> Result<PassSummary, SyncError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let scheduled = records.len();
        info!(scheduled, "starting live pass");

        let ctx = FetchContext { run_id };
        let limiter = RateLimiter::new(self.config.rate_limit_delay);
        let deadline = self.config.fetch_deadline();
        let progress_every = self.config.batch_size.max(1);
        let mut accumulator = BatchAccumulator::new(self.config.batch_size);
        let mut upserter = Upserter::new(self.store.as_ref());
        let mut counts = LiveCounts::default();

        let (limiter, ctx) = (&limiter, &ctx);
        // `buffered` yields in input order, so merges happen one identifier at
        // a time even when several fetches are in flight.
        let mut fetches = pin!(stream::iter(records)
            .map(move |record| self.fetch_one(limiter, ctx, deadline, record))
            .buffered(self.config.fetch_concurrency.max(1)));

        while let Some(fetched) = fetches.next().await {
            counts.visited += 1;
            let identifier = fetched.record.identifier.as_str();
            match fetched.outcome {
                Ok(FetchOutcome::Found(snapshot)) => {
                    let merged = merge_record(&fetched.record, &snapshot, Some(fetched.fetched_at));
                    counts.updated += 1;
                    if let Some(batch) = accumulator.push(merged) {
                        self.flush_or_abort(&mut upserter, batch, run_id).await?;
                    }
                }
                Ok(FetchOutcome::NotFound) => {
                    counts.not_found += 1;
                    debug!(identifier, "not found at source; skipping");
                }
                Err(failure) => {
                    counts.failed += 1;
                    warn!(identifier, error = %failure, "fetch failed; skipping for this pass");
                }
            }
            if counts.visited % progress_every == 0 {
                info!(visited = counts.visited, scheduled, "live pass progress");
            }
        }

        if let Some(batch) = accumulator.finish() {
            self.flush_or_abort(&mut upserter, batch, run_id).await?;
        }

        let summary = PassSummary {
            run_id,
            kind,
            started_at,
            finished_at: Utc::now(),
            elapsed_ms: elapsed_ms(clock),
            scheduled,
            visited: counts.visited,
            updated: counts.updated,
            not_found: counts.not_found,
            failed: counts.failed,
            flush: upserter.stats(),
        };
        info!(
            visited = summary.visited,
            updated = summary.updated,
            skipped = summary.skipped(),
            elapsed_ms = summary.elapsed_ms,
            "live pass complete"
        );
        Ok(summary)
    }

    async fn flush_or_abort(
        &self,
        upserter: &mut Upserter<'_>,
        batch: Vec<EntityRecord>,
        run_id: Uuid,
    ) -> Result<bool, SyncError> {
        upserter.flush(batch).await.map_err(|source| {
            error!(error = %source, "destination store lost; aborting pass");
            SyncError::Aborted {
                run_id,
                committed_batches: upserter.stats().batches_committed,
                source,
            }
        })
    }

    /// Load a CSV event log through the staging relation and merge it.
    pub async fn run_bulk_file(&self, path: &Path) -> Result<BulkSummary, SyncError> {
        let _guard = self.pass_lock.lock().await;
        let staged = self
            .store
            .stage_event_file(path)
            .await
            .map_err(SyncError::Staging)?;
        info!(
            rows = staged.events.len(),
            sha256 = %staged.source_sha256,
            path = %path.display(),
            "bulk events staged"
        );
        self.merge_bulk(staged.events, Some(staged.source_sha256), staged.source_bytes)
            .await
    }

    /// Merge already-loaded bulk events.
    pub async fn run_bulk_events(&self, events: Vec<RawEvent>) -> Result<BulkSummary, SyncError> {
        let _guard = self.pass_lock.lock().await;
        self.merge_bulk(events, None, 0).await
    }

    async fn merge_bulk(
        &self,
        events: Vec<RawEvent>,
        source_sha256: Option<String>,
        source_bytes: usize,
    ) -> Result<BulkSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("bulk_pass", %run_id);
        async move {
            let started_at = Utc::now();
            let clock = Instant::now();

            let latest = dedup_events(events);
            let input_rows = latest.input_rows;
            let unknown_mode_rows = latest.unknown_mode_rows;
            let retained_rows = latest.len();
            if unknown_mode_rows > 0 {
                warn!(unknown_mode_rows, "dropped rows with unknown mode codes");
            }
            let snapshots = latest.into_snapshots();
            info!(input_rows, retained_rows, identifiers = snapshots.len(), "bulk events deduplicated");

            let mut accumulator = BatchAccumulator::new(self.config.batch_size);
            let mut upserter = Upserter::new(self.store.as_ref());
            // New identifiers count as created only once their batch commits.
            let mut created = 0usize;
            let mut pending_new = 0usize;

            for chunk in snapshots.chunks(self.config.batch_size.max(1)) {
                let ids: Vec<String> = chunk.iter().map(|(id, _)| id.clone()).collect();
                let existing = match self.store.load_records(&ids).await {
                    Ok(rows) => rows,
                    Err(err) if err.is_fatal() => {
                        return Err(SyncError::Aborted {
                            run_id,
                            committed_batches: upserter.stats().batches_committed,
                            source: err,
                        });
                    }
                    Err(err) => {
                        error!(rows = chunk.len(), error = %err, "could not read base records; batch skipped");
                        upserter.record_lost(chunk.len());
                        continue;
                    }
                };
                let by_id: HashMap<&str, &EntityRecord> =
                    existing.iter().map(|r| (r.identifier.as_str(), r)).collect();

                for (identifier, snapshot) in chunk {
                    let merged = match by_id.get(identifier.as_str()) {
                        Some(base) => merge_record(base, snapshot, None),
                        None => {
                            pending_new += 1;
                            merge_record(&EntityRecord::new(identifier.clone()), snapshot, None)
                        }
                    };
                    if let Some(batch) = accumulator.push(merged) {
                        if self.flush_or_abort(&mut upserter, batch, run_id).await? {
                            created += pending_new;
                        }
                        pending_new = 0;
                    }
                }
            }
            if let Some(batch) = accumulator.finish() {
                if self.flush_or_abort(&mut upserter, batch, run_id).await? {
                    created += pending_new;
                }
            }

            let summary = BulkSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                elapsed_ms: elapsed_ms(clock),
                source_sha256,
                source_bytes,
                input_rows,
                unknown_mode_rows,
                retained_rows,
                identifiers: snapshots.len(),
                created,
                flush: upserter.stats(),
            };
            info!(
                identifiers = summary.identifiers,
                created = summary.created,
                rows_committed = summary.flush.rows_committed,
                elapsed_ms = summary.elapsed_ms,
                "bulk pass complete"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }
}

/// Write `summary` as `<reports_dir>/<run_id>/<name>.json`.
pub async fn write_report<T: Serialize>(
    reports_dir: &Path,
    run_id: Uuid,
    name: &str,
    summary: &T,
) -> anyhow::Result<PathBuf> {
    let run_dir = reports_dir.join(run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let path = run_dir.join(format!("{name}.json"));
    let bytes = serde_json::to_vec_pretty(summary).context("serializing pass summary")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Cron-driven repeat of the live pass, or `None` when scheduling is disabled.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> anyhow::Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }
    let cron = pipeline.config().sync_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_live_pass().await {
                Ok(summary) => {
                    let reports_dir = pipeline.config().reports_dir.clone();
                    if let Err(err) = write_report(&reports_dir, summary.run_id, "summary", &summary).await {
                        warn!(error = %err, "could not write pass report");
                    }
                }
                Err(err) => error!(error = %err, "scheduled live pass failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
