//! Durable per-source checkpoints and the run audit log
//!
//! A checkpoint row doubles as the per-source lock: `begin_run` only succeeds
//! when no other run owns the row, or when the owner has been `running` for
//! longer than the stale threshold. Commits are keyed on the owning run id, so
//! a run that lost its lock cannot move the cursor.

use crate::error::{EtlError, EtlResult};
use crate::ingest::types::{Checkpoint, CheckpointStatus, RunRecord, RunStatus};
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Ownership token for an in-flight run
#[derive(Debug, Clone, PartialEq)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub source: String,
    pub started_at: DateTime<Utc>,
    /// Checkpoint status before this run took it over
    pub previous_status: CheckpointStatus,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    pool: SqlitePool,
    stale_after: Duration,
}

impl CheckpointStore {
    pub fn new(pool: SqlitePool, stale_after: Duration) -> Self {
        Self { pool, stale_after }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Current checkpoint, or the zero value when the source never ran
    pub async fn get(&self, source: &str) -> EtlResult<Checkpoint> {
        let checkpoint = sqlx::query_as::<_, Checkpoint>(
            "SELECT * FROM checkpoints WHERE source = ?1",
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;

        Ok(checkpoint.unwrap_or_else(|| Checkpoint::new(source)))
    }

    pub async fn list(&self) -> EtlResult<Vec<Checkpoint>> {
        let checkpoints =
            sqlx::query_as::<_, Checkpoint>("SELECT * FROM checkpoints ORDER BY source")
                .fetch_all(&self.pool)
                .await?;
        Ok(checkpoints)
    }

    fn is_stale(&self, started_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let threshold = TimeDelta::from_std(self.stale_after).unwrap_or(TimeDelta::MAX);
        started_at.is_none_or(|started| now - started >= threshold)
    }

    /// Mark the source `running` and open a run record.
    ///
    /// Fails with [`EtlError::RunInProgress`] while another non-stale run owns
    /// the checkpoint. A stale owner's run record is closed as failed.
    pub async fn begin_run(&self, source: &str) -> EtlResult<RunHandle> {
        let mut tx = self.pool.begin().await?;

        // First statement is a write so the transaction holds the write lock throughout
        sqlx::query(
            "INSERT INTO checkpoints (source, status) VALUES (?1, 'idle') ON CONFLICT(source) DO NOTHING",
        )
        .bind(source)
        .execute(&mut *tx)
        .await?;

        let current = sqlx::query_as::<_, Checkpoint>("SELECT * FROM checkpoints WHERE source = ?1")
            .bind(source)
            .fetch_one(&mut *tx)
            .await?;

        let now = Utc::now();
        if current.status == CheckpointStatus::Running {
            if !self.is_stale(current.last_run_started_at, now) {
                return Err(EtlError::RunInProgress(source.to_string()));
            }

            warn!(
                source,
                stale_run_id = ?current.current_run_id,
                started_at = ?current.last_run_started_at,
                "Releasing stale checkpoint lock"
            );
            if let Some(stale_run) = current.current_run_id {
                sqlx::query(
                    r#"
                    UPDATE etl_runs
                    SET status = 'failed', completed_at = ?2,
                        error_message = 'abandoned: stale checkpoint lock released'
                    WHERE run_id = ?1 AND status = 'running'
                    "#,
                )
                .bind(stale_run)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        let run_id = Uuid::new_v4();
        let claimed = sqlx::query(
            r#"
            UPDATE checkpoints
            SET status = 'running', current_run_id = ?2, last_run_started_at = ?3
            WHERE source = ?1 AND current_run_id IS ?4
            "#,
        )
        .bind(source)
        .bind(run_id)
        .bind(now)
        .bind(current.current_run_id)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            return Err(EtlError::RunInProgress(source.to_string()));
        }

        sqlx::query(
            "INSERT INTO etl_runs (run_id, source, status, started_at) VALUES (?1, ?2, 'running', ?3)",
        )
        .bind(run_id)
        .bind(source)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(source, %run_id, "Run started");

        Ok(RunHandle {
            run_id,
            source: source.to_string(),
            started_at: now,
            previous_status: current.status,
        })
    }

    /// Advance the cursor and close the run as successful, atomically.
    ///
    /// A `None` cursor keeps the current one.
    pub async fn commit_success(
        &self,
        run: &RunHandle,
        next_cursor: Option<&str>,
        records_processed: i64,
        records_failed: i64,
    ) -> EtlResult<RunRecord> {
        let mut tx = self.pool.begin().await?;
        let completed_at = Utc::now();

        let updated = sqlx::query(
            r#"
            UPDATE checkpoints
            SET cursor = COALESCE(?3, cursor),
                status = 'success',
                current_run_id = NULL,
                last_run_completed_at = ?4,
                records_processed = ?5,
                error_message = NULL
            WHERE source = ?1 AND current_run_id = ?2
            "#,
        )
        .bind(&run.source)
        .bind(run.run_id)
        .bind(next_cursor)
        .bind(completed_at)
        .bind(records_processed)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.stale_run(run));
        }

        let record = close_run(
            &mut *tx,
            run,
            RunStatus::Success,
            records_processed,
            records_failed,
            None,
            completed_at,
        )
        .await?;

        tx.commit().await?;
        info!(
            source = %run.source,
            run_id = %run.run_id,
            cursor = ?next_cursor,
            records_processed,
            records_failed,
            "Checkpoint committed"
        );

        Ok(record)
    }

    /// Close the run as failed. The cursor is never touched.
    pub async fn commit_failure(
        &self,
        run: &RunHandle,
        error: &str,
        records_processed: i64,
        records_failed: i64,
    ) -> EtlResult<RunRecord> {
        let mut tx = self.pool.begin().await?;
        let completed_at = Utc::now();

        let updated = sqlx::query(
            r#"
            UPDATE checkpoints
            SET status = 'failed',
                current_run_id = NULL,
                last_run_completed_at = ?3,
                error_message = ?4
            WHERE source = ?1 AND current_run_id = ?2
            "#,
        )
        .bind(&run.source)
        .bind(run.run_id)
        .bind(completed_at)
        .bind(error)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.stale_run(run));
        }

        let record = close_run(
            &mut *tx,
            run,
            RunStatus::Failed,
            records_processed,
            records_failed,
            Some(error),
            completed_at,
        )
        .await?;

        tx.commit().await?;
        warn!(source = %run.source, run_id = %run.run_id, error, "Run failed");

        Ok(record)
    }

    /// Release the checkpoint without a verdict and close the run as cancelled.
    ///
    /// The checkpoint returns to the status it had before the run began.
    pub async fn abort_run(&self, run: &RunHandle, reason: &str) -> EtlResult<RunRecord> {
        let mut tx = self.pool.begin().await?;
        let completed_at = Utc::now();

        let restored = match run.previous_status {
            // a stale owner was displaced; it did not finish cleanly
            CheckpointStatus::Running => CheckpointStatus::Failed,
            other => other,
        };

        let updated = sqlx::query(
            r#"
            UPDATE checkpoints
            SET status = ?3, current_run_id = NULL
            WHERE source = ?1 AND current_run_id = ?2
            "#,
        )
        .bind(&run.source)
        .bind(run.run_id)
        .bind(restored.as_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.stale_run(run));
        }

        let record = close_run(
            &mut *tx,
            run,
            RunStatus::Cancelled,
            0,
            0,
            Some(reason),
            completed_at,
        )
        .await?;

        tx.commit().await?;
        info!(source = %run.source, run_id = %run.run_id, reason, "Run cancelled");

        Ok(record)
    }

    pub async fn get_run(&self, run_id: Uuid) -> EtlResult<Option<RunRecord>> {
        let run = sqlx::query_as::<_, RunRecord>("SELECT * FROM etl_runs WHERE run_id = ?1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(run)
    }

    /// Most recent runs first
    pub async fn list_runs(&self, source: Option<&str>, limit: i64) -> EtlResult<Vec<RunRecord>> {
        let runs = sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT * FROM etl_runs
            WHERE ?1 IS NULL OR source = ?1
            ORDER BY started_at DESC, rowid DESC
            LIMIT ?2
            "#,
        )
        .bind(source)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(runs)
    }

    fn stale_run(&self, run: &RunHandle) -> EtlError {
        warn!(source = %run.source, run_id = %run.run_id, "Run no longer owns its checkpoint");
        EtlError::StaleRun {
            source_name: run.source.clone(),
            run_id: run.run_id,
        }
    }
}

async fn close_run(
    conn: &mut SqliteConnection,
    run: &RunHandle,
    status: RunStatus,
    records_processed: i64,
    records_failed: i64,
    error: Option<&str>,
    completed_at: DateTime<Utc>,
) -> EtlResult<RunRecord> {
    let duration_ms = (completed_at - run.started_at).num_milliseconds().max(0);

    let record = sqlx::query_as::<_, RunRecord>(
        r#"
        UPDATE etl_runs
        SET status = ?2,
            records_processed = ?3,
            records_failed = ?4,
            completed_at = ?5,
            duration_ms = ?6,
            error_message = ?7
        WHERE run_id = ?1
        RETURNING *
        "#,
    )
    .bind(run.run_id)
    .bind(status.as_str())
    .bind(records_processed)
    .bind(records_failed)
    .bind(completed_at)
    .bind(duration_ms)
    .bind(error)
    .fetch_one(&mut *conn)
    .await?;

    Ok(record)
}
