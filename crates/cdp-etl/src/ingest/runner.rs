//! End-to-end ingestion run for one source
//!
//! A run claims the source's checkpoint, fetches from the stored cursor
//! (rate-limited, with retries for transient errors), records schema drift,
//! normalizes and upserts the batch in one transaction, links records to
//! master entities and finally commits the new cursor. Any failure after the
//! claim is recorded against the checkpoint without moving the cursor.

use crate::config::EtlConfig;
use crate::error::{EtlError, EtlResult};
use crate::ingest::adapter::SourceAdapter;
use crate::ingest::checkpoint::{CheckpointStore, RunHandle};
use crate::ingest::drift::{self, SchemaDriftDetector, DEFAULT_SAMPLE_SIZE};
use crate::ingest::entity::EntityResolver;
use crate::ingest::failure::FailureInjector;
use crate::ingest::rate_limiter::TokenBucket;
use crate::ingest::records::RecordStore;
use crate::ingest::retry::RetryPolicy;
use crate::ingest::sources::{self, SourceRegistration};
use crate::ingest::types::{Checkpoint, DriftObservation, FetchedBatch, RunRecord, StoredRecord};
use futures::future::join_all;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(1800);
pub const DEFAULT_PRIORITY_SOURCE: &str = "coingecko";

struct SourceEntry {
    adapter: Arc<dyn SourceAdapter>,
    limiter: Option<Arc<TokenBucket>>,
}

/// Counters for the run in progress
#[derive(Debug, Default)]
struct RunProgress {
    persisted: i64,
    failed: i64,
    persistence_started: bool,
}

pub struct IngestionRunner {
    pool: SqlitePool,
    checkpoints: CheckpointStore,
    records: RecordStore,
    resolver: EntityResolver,
    detector: SchemaDriftDetector,
    injector: Option<FailureInjector>,
    retry: RetryPolicy,
    sources: BTreeMap<String, SourceEntry>,
}

/// Builder for [`IngestionRunner`]
pub struct RunnerBuilder {
    pool: SqlitePool,
    sources: BTreeMap<String, SourceEntry>,
    injector: Option<FailureInjector>,
    retry: RetryPolicy,
    stale_after: Duration,
    drift_sample_size: usize,
    priority_source: String,
}

impl RunnerBuilder {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            sources: BTreeMap::new(),
            injector: None,
            retry: RetryPolicy::default(),
            stale_after: DEFAULT_STALE_AFTER,
            drift_sample_size: DEFAULT_SAMPLE_SIZE,
            priority_source: DEFAULT_PRIORITY_SOURCE.to_string(),
        }
    }

    /// Register an adapter under its own name; a later registration replaces an earlier one
    pub fn source(mut self, adapter: Arc<dyn SourceAdapter>, limiter: Option<Arc<TokenBucket>>) -> Self {
        self.sources
            .insert(adapter.name().to_string(), SourceEntry { adapter, limiter });
        self
    }

    pub fn sources(self, registrations: Vec<SourceRegistration>) -> Self {
        registrations
            .into_iter()
            .fold(self, |builder, r| builder.source(r.adapter, r.limiter))
    }

    pub fn failure_injector(mut self, injector: Option<FailureInjector>) -> Self {
        self.injector = injector.filter(FailureInjector::is_enabled);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn drift_sample_size(mut self, sample_size: usize) -> Self {
        self.drift_sample_size = sample_size;
        self
    }

    pub fn priority_source(mut self, source: impl Into<String>) -> Self {
        self.priority_source = source.into();
        self
    }

    pub fn build(self) -> IngestionRunner {
        IngestionRunner {
            checkpoints: CheckpointStore::new(self.pool.clone(), self.stale_after),
            records: RecordStore::new(self.pool.clone()),
            resolver: EntityResolver::new(self.pool.clone(), self.priority_source),
            detector: SchemaDriftDetector::new(self.drift_sample_size),
            injector: self.injector,
            retry: self.retry,
            sources: self.sources,
            pool: self.pool,
        }
    }
}

impl IngestionRunner {
    pub fn builder(pool: SqlitePool) -> RunnerBuilder {
        RunnerBuilder::new(pool)
    }

    /// Runner with every configured source registered
    pub fn from_config(pool: SqlitePool, config: &EtlConfig) -> EtlResult<Self> {
        Ok(RunnerBuilder::new(pool)
            .sources(sources::from_config(config)?)
            .failure_injector(config.failure_injection.injector())
            .retry_policy(config.retry.policy())
            .stale_after(config.runner.stale_after())
            .drift_sample_size(config.runner.drift_sample_size)
            .priority_source(config.runner.primary_source.clone())
            .build())
    }

    /// Registered source names, sorted
    pub fn source_names(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    pub fn resolver(&self) -> &EntityResolver {
        &self.resolver
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub async fn run(&self, source: &str) -> EtlResult<RunRecord> {
        self.run_with_cancellation(source, CancellationToken::new())
            .await
    }

    /// Run every registered source once, concurrently
    pub async fn run_all(&self, cancel: CancellationToken) -> Vec<(String, EtlResult<RunRecord>)> {
        let runs = self.sources.keys().map(move |source| {
            let cancel = cancel.child_token();
            async move {
                let result = self.run_with_cancellation(source, cancel).await;
                (source.clone(), result)
            }
        });
        join_all(runs).await
    }

    /// Run once, stopping early when `cancel` fires.
    ///
    /// Cancellation before persistence began closes the run as cancelled and
    /// restores the checkpoint; cancellation afterwards is a failure.
    pub async fn run_with_cancellation(
        &self,
        source: &str,
        cancel: CancellationToken,
    ) -> EtlResult<RunRecord> {
        let entry = self
            .sources
            .get(source)
            .ok_or_else(|| EtlError::UnknownSource(source.to_string()))?;

        let run = self.checkpoints.begin_run(source).await?;
        let span = info_span!("ingestion_run", source, run_id = %run.run_id);

        async {
            let mut progress = RunProgress::default();
            let outcome = self.execute(entry, &run, &cancel, &mut progress).await;
            self.finish(&run, outcome, &progress).await
        }
        .instrument(span)
        .await
    }

    async fn finish(
        &self,
        run: &RunHandle,
        outcome: EtlResult<Option<String>>,
        progress: &RunProgress,
    ) -> EtlResult<RunRecord> {
        match outcome {
            Ok(next_cursor) => {
                match self
                    .checkpoints
                    .commit_success(run, next_cursor.as_deref(), progress.persisted, progress.failed)
                    .await
                {
                    Ok(record) => {
                        info!(
                            records_processed = record.records_processed,
                            records_failed = record.records_failed,
                            duration = ?record.duration,
                            "Run completed"
                        );
                        Ok(record)
                    },
                    Err(e @ EtlError::StaleRun { .. }) => Err(e),
                    Err(e) => {
                        self.record_failure(run, &e, progress).await;
                        Err(e)
                    },
                }
            },
            Err(e @ EtlError::Cancelled(_)) if !progress.persistence_started => {
                if let Err(abort_err) = self.checkpoints.abort_run(run, &e.to_string()).await {
                    error!(error = %abort_err, "Failed to release checkpoint after cancellation");
                }
                Err(e)
            },
            Err(e) => {
                self.record_failure(run, &e, progress).await;
                Err(e)
            },
        }
    }

    async fn record_failure(&self, run: &RunHandle, err: &EtlError, progress: &RunProgress) {
        error!(error = %err, "Run failed");
        if let Err(commit_err) = self
            .checkpoints
            .commit_failure(run, &err.to_string(), progress.persisted, progress.failed)
            .await
        {
            error!(error = %commit_err, "Failed to record run failure");
        }
    }

    async fn execute(
        &self,
        entry: &SourceEntry,
        run: &RunHandle,
        cancel: &CancellationToken,
        progress: &mut RunProgress,
    ) -> EtlResult<Option<String>> {
        let source = run.source.as_str();
        let checkpoint = self.checkpoints.get(source).await?;
        info!(cursor = ?checkpoint.cursor, "Resuming from checkpoint");

        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(EtlError::Cancelled("cancelled during fetch".to_string()));
            },
            result = self.fetch(entry, checkpoint.cursor.as_deref()) => result?,
        };

        let report = self
            .detector
            .analyze_batch(&batch.records, &entry.adapter.expected_schema());
        if let Err(e) = drift::record_observation(&self.pool, source, run.run_id, &report).await {
            error!(error = %e, "Failed to record drift observation");
        }

        let mut survivors = Vec::with_capacity(batch.records.len());
        for (index, raw) in batch.records.iter().enumerate() {
            let normalized = match &self.injector {
                Some(injector) => injector.maybe_fail(index),
                None => Ok(()),
            }
            .and_then(|()| entry.adapter.normalize(raw));

            match normalized {
                Ok(record) => survivors.push(record),
                Err(e) if e.is_validation() => {
                    progress.failed += 1;
                    warn!(index, error = %e, "Skipping invalid record");
                },
                Err(e) => return Err(e),
            }
        }

        if cancel.is_cancelled() {
            return Err(EtlError::Cancelled("cancelled before persistence".to_string()));
        }

        progress.persistence_started = true;
        let ids = self
            .records
            .persist_batch(source, run.run_id, &batch.records, &survivors)
            .await?;
        progress.persisted = ids.len() as i64;
        debug!(persisted = progress.persisted, failed = progress.failed, "Batch persisted");

        for (record_id, record) in ids.iter().zip(&survivors) {
            self.resolver
                .resolve(&record.symbol, record.display_name.as_deref(), source, *record_id)
                .await?;
        }

        if cancel.is_cancelled() {
            return Err(EtlError::Cancelled("cancelled after persistence".to_string()));
        }

        Ok(batch.next_cursor)
    }

    async fn fetch(&self, entry: &SourceEntry, cursor: Option<&str>) -> EtlResult<FetchedBatch> {
        self.retry
            .run("fetch", |attempt| async move {
                if let Some(limiter) = &entry.limiter {
                    limiter.acquire(1).await?;
                }
                debug!(attempt, "Fetching batch");
                entry.adapter.fetch(cursor).await
            })
            .await
    }

    // ------------------------------------------------------------------
    // Read side
    // ------------------------------------------------------------------

    pub async fn get_checkpoint(&self, source: &str) -> EtlResult<Checkpoint> {
        self.checkpoints.get(source).await
    }

    pub async fn list_checkpoints(&self) -> EtlResult<Vec<Checkpoint>> {
        self.checkpoints.list().await
    }

    pub async fn list_runs(&self, source: Option<&str>, limit: i64) -> EtlResult<Vec<RunRecord>> {
        self.checkpoints.list_runs(source, limit).await
    }

    pub async fn get_drift_observations(
        &self,
        source: Option<&str>,
        limit: i64,
    ) -> EtlResult<Vec<DriftObservation>> {
        drift::list_observations(&self.pool, source, limit).await
    }

    pub async fn record_counts(&self) -> EtlResult<Vec<(String, i64)>> {
        self.records.count_by_source().await
    }

    pub async fn records_by_symbol(&self, symbol: &str, limit: i64) -> EtlResult<Vec<StoredRecord>> {
        self.records.list_by_symbol(symbol, limit).await
    }

    /// Link stored records that have no master entity yet
    pub async fn backfill_entities(&self) -> EtlResult<usize> {
        self.resolver.backfill().await
    }
}
