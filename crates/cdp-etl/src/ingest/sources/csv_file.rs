//! Delimited file adapter
//!
//! The cursor is the number of data rows already consumed. Rows appended to
//! the file after a run are picked up by the next one.

use super::{
    optional_decimal, optional_str, required_decimal, required_str, required_timestamp, schema,
};
use crate::error::{EtlError, EtlResult};
use crate::ingest::adapter::SourceAdapter;
use crate::ingest::types::{FetchedBatch, NormalizedRecord, RawRecord};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const SOURCE_NAME: &str = "csv";

pub struct CsvFileAdapter {
    path: PathBuf,
}

impl CsvFileAdapter {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn offset_from_cursor(cursor: Option<&str>) -> EtlResult<usize> {
        match cursor {
            None => Ok(0),
            Some(c) => c
                .trim()
                .parse()
                .map_err(|_| EtlError::orchestration(format!("invalid row offset cursor: {}", c))),
        }
    }
}

/// Rows after `offset`, keyed by header. Short rows simply lack trailing fields.
fn read_rows(path: &Path, offset: usize) -> EtlResult<Vec<RawRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| EtlError::orchestration(format!("Failed to open {}: {}", path.display(), e)))?;

    let headers = reader
        .headers()
        .map_err(|e| EtlError::orchestration(format!("Failed to read CSV header: {}", e)))?
        .clone();

    let mut rows = Vec::new();
    for (index, row) in reader.records().enumerate().skip(offset) {
        let row = row.map_err(|e| {
            EtlError::orchestration(format!("Failed to read CSV row {}: {}", index, e))
        })?;

        let record: RawRecord = headers
            .iter()
            .zip(row.iter())
            .map(|(name, value)| (name.to_string(), Value::String(value.to_string())))
            .collect();
        rows.push(record);
    }

    Ok(rows)
}

#[async_trait]
impl SourceAdapter for CsvFileAdapter {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn fetch(&self, cursor: Option<&str>) -> EtlResult<FetchedBatch> {
        let offset = Self::offset_from_cursor(cursor)?;

        match tokio::fs::try_exists(&self.path).await {
            Ok(true) => {},
            Ok(false) => {
                warn!(path = %self.path.display(), "CSV file not found, nothing to ingest");
                return Ok(FetchedBatch::empty());
            },
            Err(e) => {
                return Err(EtlError::orchestration(format!(
                    "Failed to check {}: {}",
                    self.path.display(),
                    e
                )));
            },
        }

        let path = self.path.clone();
        let records = tokio::task::spawn_blocking(move || read_rows(&path, offset))
            .await
            .map_err(|e| EtlError::orchestration(format!("CSV reader task failed: {}", e)))??;

        info!(
            path = %self.path.display(),
            offset,
            count = records.len(),
            "Read CSV rows"
        );

        let next_offset = offset + records.len();
        Ok(FetchedBatch::new(records, Some(next_offset.to_string())))
    }

    fn normalize(&self, raw: &RawRecord) -> EtlResult<NormalizedRecord> {
        Ok(NormalizedRecord {
            source: SOURCE_NAME.to_string(),
            external_id: required_str(raw, "id")?,
            symbol: required_str(raw, "symbol")?.to_uppercase(),
            display_name: optional_str(raw, "name"),
            numeric_value: required_decimal(raw, "price")?,
            secondary_numeric: optional_decimal(raw, "market_cap")?,
            tertiary_numeric: optional_decimal(raw, "volume_24h")?,
            delta_numeric: optional_decimal(raw, "price_change_24h")?,
            observed_at: required_timestamp(raw, "timestamp")?,
        })
    }

    fn expected_schema(&self) -> BTreeSet<String> {
        schema(&[
            "id",
            "symbol",
            "name",
            "price",
            "market_cap",
            "volume_24h",
            "price_change_24h",
            "timestamp",
        ])
    }
}
