//! Interval scheduler
//!
//! Every tick starts one run per registered source. Sources run concurrently;
//! a source whose previous run has not finished is skipped for that tick.
//! Run failures are logged and never stop the loop.

use crate::error::{EtlError, EtlResult};
use crate::ingest::runner::IngestionRunner;
use crate::ingest::types::RunRecord;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{Id, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Scheduler {
    runner: Arc<IngestionRunner>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(runner: Arc<IngestionRunner>, interval: Duration) -> Self {
        Self { runner, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run until `shutdown` is cancelled, then cancel in-flight runs and wait for them.
    ///
    /// Returns the number of runs that finished.
    pub async fn run(&self, shutdown: CancellationToken) -> usize {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut tasks: JoinSet<(String, EtlResult<RunRecord>)> = JoinSet::new();
        let mut in_flight: HashMap<Id, String> = HashMap::new();
        let mut completed = 0;

        info!(
            interval_secs = self.interval.as_secs(),
            sources = ?self.runner.source_names(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!(in_flight = in_flight.len(), "Shutdown requested, draining runs");
                    break;
                },

                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    completed += 1;
                    Self::on_finished(joined, &mut in_flight);
                },

                _ = ticker.tick() => {
                    self.spawn_due(&mut tasks, &mut in_flight, &shutdown);
                },
            }
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            completed += 1;
            Self::on_finished(joined, &mut in_flight);
        }

        info!(completed, "Scheduler stopped");
        completed
    }

    fn spawn_due(
        &self,
        tasks: &mut JoinSet<(String, EtlResult<RunRecord>)>,
        in_flight: &mut HashMap<Id, String>,
        shutdown: &CancellationToken,
    ) {
        for source in self.runner.source_names() {
            if in_flight.values().any(|s| *s == source) {
                debug!(source = %source, "Previous run still in flight, skipping");
                continue;
            }

            let runner = Arc::clone(&self.runner);
            let cancel = shutdown.child_token();
            let name = source.clone();
            let handle = tasks.spawn(async move {
                let result = runner.run_with_cancellation(&name, cancel).await;
                (name, result)
            });
            in_flight.insert(handle.id(), source);
        }
    }

    fn on_finished(
        joined: Result<(Id, (String, EtlResult<RunRecord>)), tokio::task::JoinError>,
        in_flight: &mut HashMap<Id, String>,
    ) {
        match joined {
            Ok((id, (source, result))) => {
                in_flight.remove(&id);
                match result {
                    Ok(record) => info!(
                        source = %source,
                        run_id = %record.run_id,
                        records_processed = record.records_processed,
                        records_failed = record.records_failed,
                        "Scheduled run finished"
                    ),
                    Err(EtlError::RunInProgress(_)) => {
                        debug!(source = %source, "Run already in progress elsewhere")
                    },
                    Err(EtlError::Cancelled(reason)) => {
                        warn!(source = %source, reason = %reason, "Scheduled run cancelled")
                    },
                    Err(e) => error!(source = %source, error = %e, "Scheduled run failed"),
                }
            },
            Err(join_err) => {
                let source = in_flight.remove(&join_err.id());
                error!(source = ?source, error = %join_err, "Scheduled run panicked");
            },
        }
    }
}
