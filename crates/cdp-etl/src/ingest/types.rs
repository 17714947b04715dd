//! Core types shared by the ingestion pipeline

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::error::BoxDynError;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// One record exactly as the source delivered it
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Result of one `fetch` call
#[derive(Debug, Clone, Default)]
pub struct FetchedBatch {
    pub records: Vec<RawRecord>,
    /// Cursor to resume from next time; `None` keeps the current one
    pub next_cursor: Option<String>,
}

impl FetchedBatch {
    pub fn new(records: Vec<RawRecord>, next_cursor: Option<String>) -> Self {
        Self {
            records,
            next_cursor,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// A record in the unified schema, ready for upsert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub source: String,
    /// Unique within `source`
    pub external_id: String,
    pub symbol: String,
    pub display_name: Option<String>,
    pub numeric_value: BigDecimal,
    pub secondary_numeric: Option<BigDecimal>,
    pub tertiary_numeric: Option<BigDecimal>,
    pub delta_numeric: Option<BigDecimal>,
    pub observed_at: DateTime<Utc>,
}

/// A persisted normalized record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub id: i64,
    pub record: NormalizedRecord,
    pub ingested_at: DateTime<Utc>,
}

fn decode_error(column: &str, err: impl Into<BoxDynError>) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: err.into(),
    }
}

fn decimal_column(row: &SqliteRow, column: &str) -> sqlx::Result<Option<BigDecimal>> {
    let text: Option<String> = row.try_get(column)?;
    text.map(|t| BigDecimal::from_str(&t).map_err(|e| decode_error(column, e)))
        .transpose()
}

fn json_column<T: serde::de::DeserializeOwned>(row: &SqliteRow, column: &str) -> sqlx::Result<T> {
    let text: String = row.try_get(column)?;
    serde_json::from_str(&text).map_err(|e| decode_error(column, e))
}

impl<'r> FromRow<'r, SqliteRow> for StoredRecord {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        let numeric_value = decimal_column(row, "numeric_value")?
            .ok_or_else(|| decode_error("numeric_value", "unexpected NULL"))?;

        Ok(StoredRecord {
            id: row.try_get("id")?,
            record: NormalizedRecord {
                source: row.try_get("source")?,
                external_id: row.try_get("external_id")?,
                symbol: row.try_get("symbol")?,
                display_name: row.try_get("display_name")?,
                numeric_value,
                secondary_numeric: decimal_column(row, "secondary_numeric")?,
                tertiary_numeric: decimal_column(row, "tertiary_numeric")?,
                delta_numeric: decimal_column(row, "delta_numeric")?,
                observed_at: row.try_get("observed_at")?,
            },
            ingested_at: row.try_get("ingested_at")?,
        })
    }
}

/// Checkpoint status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// No run has started yet
    Idle,
    Running,
    Success,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Idle => "idle",
            CheckpointStatus::Running => "running",
            CheckpointStatus::Success => "success",
            CheckpointStatus::Failed => "failed",
        }
    }
}

impl From<String> for CheckpointStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => CheckpointStatus::Running,
            "success" => CheckpointStatus::Success,
            "failed" => CheckpointStatus::Failed,
            _ => CheckpointStatus::Idle,
        }
    }
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable cursor and run status for one source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checkpoint {
    pub source: String,
    /// Opaque to everything but the source's adapter
    pub cursor: Option<String>,
    pub status: CheckpointStatus,
    /// Run that currently owns this checkpoint
    pub current_run_id: Option<Uuid>,
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub last_run_completed_at: Option<DateTime<Utc>>,
    pub records_processed: i64,
    pub error_message: Option<String>,
}

impl Checkpoint {
    /// Zero value for a source that has never run
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            cursor: None,
            status: CheckpointStatus::Idle,
            current_run_id: None,
            last_run_started_at: None,
            last_run_completed_at: None,
            records_processed: 0,
            error_message: None,
        }
    }
}

impl<'r> FromRow<'r, SqliteRow> for Checkpoint {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(Checkpoint {
            source: row.try_get("source")?,
            cursor: row.try_get("cursor")?,
            status: CheckpointStatus::from(row.try_get::<String, _>("status")?),
            current_run_id: row.try_get("current_run_id")?,
            last_run_started_at: row.try_get("last_run_started_at")?,
            last_run_completed_at: row.try_get("last_run_completed_at")?,
            records_processed: row.try_get("records_processed")?,
            error_message: row.try_get("error_message")?,
        })
    }
}

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl From<String> for RunStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "success" => RunStatus::Success,
            "failed" => RunStatus::Failed,
            "cancelled" => RunStatus::Cancelled,
            _ => RunStatus::Running,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the append-only run log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub source: String,
    pub status: RunStatus,
    pub records_processed: i64,
    pub records_failed: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub error_message: Option<String>,
}

impl<'r> FromRow<'r, SqliteRow> for RunRecord {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        let duration_ms: Option<i64> = row.try_get("duration_ms")?;

        Ok(RunRecord {
            run_id: row.try_get("run_id")?,
            source: row.try_get("source")?,
            status: RunStatus::from(row.try_get::<String, _>("status")?),
            records_processed: row.try_get("records_processed")?,
            records_failed: row.try_get("records_failed")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            duration: duration_ms.map(|ms| Duration::from_millis(ms.max(0) as u64)),
            error_message: row.try_get("error_message")?,
        })
    }
}

/// Persisted drift findings for one analyzed batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftObservation {
    pub id: i64,
    pub source: String,
    pub run_id: Uuid,
    pub confidence_score: f64,
    pub missing_fields: BTreeSet<String>,
    pub extra_fields: BTreeSet<String>,
    /// observed field -> expected field
    pub fuzzy_renames: BTreeMap<String, String>,
    pub flagged: bool,
    pub sample_count: i64,
    pub warnings: Vec<String>,
    pub detected_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for DriftObservation {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(DriftObservation {
            id: row.try_get("id")?,
            source: row.try_get("source")?,
            run_id: row.try_get("run_id")?,
            confidence_score: row.try_get("confidence_score")?,
            missing_fields: json_column(row, "missing_fields")?,
            extra_fields: json_column(row, "extra_fields")?,
            fuzzy_renames: json_column(row, "fuzzy_renames")?,
            flagged: row.try_get("flagged")?,
            sample_count: row.try_get("sample_count")?,
            warnings: json_column(row, "warnings")?,
            detected_at: row.try_get("detected_at")?,
        })
    }
}

/// Canonical entity shared by records from different sources
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct MasterEntity {
    pub id: i64,
    pub canonical_symbol: String,
    pub canonical_name: String,
    pub primary_source: String,
    pub primary_record_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Link from a normalized record to its master entity
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct EntityMapping {
    pub id: i64,
    pub master_entity_id: i64,
    pub record_id: i64,
    pub source: String,
    pub confidence: f64,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}
