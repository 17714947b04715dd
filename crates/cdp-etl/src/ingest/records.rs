//! Idempotent record persistence and the raw payload archive

use crate::error::EtlResult;
use crate::ingest::types::{NormalizedRecord, RawRecord, StoredRecord};
use cdp_common::checksum::payload_checksum;
use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

/// Insert or update each record on (source, external_id), returning row ids
/// in input order.
///
/// One conditional write per record. `source`, `external_id` and
/// `ingested_at` are never changed by the update branch, so replaying the
/// same batch leaves the table as it was.
pub async fn upsert_records(
    conn: &mut SqliteConnection,
    records: &[NormalizedRecord],
) -> EtlResult<Vec<i64>> {
    let ingested_at = Utc::now();
    let mut ids = Vec::with_capacity(records.len());

    for record in records {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO normalized_records (
                source, external_id, symbol, display_name, numeric_value,
                secondary_numeric, tertiary_numeric, delta_numeric, observed_at, ingested_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(source, external_id) DO UPDATE SET
                symbol = excluded.symbol,
                display_name = excluded.display_name,
                numeric_value = excluded.numeric_value,
                secondary_numeric = excluded.secondary_numeric,
                tertiary_numeric = excluded.tertiary_numeric,
                delta_numeric = excluded.delta_numeric,
                observed_at = excluded.observed_at
            RETURNING id
            "#,
        )
        .bind(&record.source)
        .bind(&record.external_id)
        .bind(&record.symbol)
        .bind(&record.display_name)
        .bind(record.numeric_value.to_string())
        .bind(record.secondary_numeric.as_ref().map(ToString::to_string))
        .bind(record.tertiary_numeric.as_ref().map(ToString::to_string))
        .bind(record.delta_numeric.as_ref().map(ToString::to_string))
        .bind(record.observed_at)
        .bind(ingested_at)
        .fetch_one(&mut *conn)
        .await?;

        ids.push(id);
    }

    debug!(count = ids.len(), "Upserted records");
    Ok(ids)
}

fn external_id_of(raw: &RawRecord) -> Option<String> {
    match raw.get("id")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Append fetched payloads to the archive with their content hash
pub async fn archive_raw(
    conn: &mut SqliteConnection,
    source: &str,
    run_id: Uuid,
    records: &[RawRecord],
) -> EtlResult<()> {
    let fetched_at = Utc::now();

    for raw in records {
        let payload = serde_json::to_string(raw)?;
        let hash = payload_checksum(raw)?;

        sqlx::query(
            r#"
            INSERT INTO raw_records (source, run_id, external_id, payload, content_hash, fetched_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(source)
        .bind(run_id)
        .bind(external_id_of(raw))
        .bind(payload)
        .bind(hash)
        .bind(fetched_at)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Read side of the record tables
#[derive(Debug, Clone)]
pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Archive raw payloads and upsert normalized records in one transaction
    pub async fn persist_batch(
        &self,
        source: &str,
        run_id: Uuid,
        raw: &[RawRecord],
        records: &[NormalizedRecord],
    ) -> EtlResult<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        archive_raw(&mut *tx, source, run_id, raw).await?;
        let ids = upsert_records(&mut *tx, records).await?;
        tx.commit().await?;
        Ok(ids)
    }

    pub async fn get(&self, source: &str, external_id: &str) -> EtlResult<Option<StoredRecord>> {
        let record = sqlx::query_as::<_, StoredRecord>(
            "SELECT * FROM normalized_records WHERE source = ?1 AND external_id = ?2",
        )
        .bind(source)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn get_by_id(&self, id: i64) -> EtlResult<Option<StoredRecord>> {
        let record =
            sqlx::query_as::<_, StoredRecord>("SELECT * FROM normalized_records WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record)
    }

    pub async fn count(&self, source: Option<&str>) -> EtlResult<i64> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM normalized_records WHERE ?1 IS NULL OR source = ?1",
        )
        .bind(source)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// (source, record count) pairs ordered by source
    pub async fn count_by_source(&self) -> EtlResult<Vec<(String, i64)>> {
        let counts = sqlx::query_as::<_, (String, i64)>(
            "SELECT source, COUNT(*) FROM normalized_records GROUP BY source ORDER BY source",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(counts)
    }

    /// Records for a symbol across all sources, newest observation first
    pub async fn list_by_symbol(&self, symbol: &str, limit: i64) -> EtlResult<Vec<StoredRecord>> {
        let records = sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT * FROM normalized_records
            WHERE symbol = ?1
            ORDER BY observed_at DESC, id DESC
            LIMIT ?2
            "#,
        )
        .bind(symbol.trim().to_uppercase())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn raw_count(&self, source: Option<&str>) -> EtlResult<i64> {
        let count =
            sqlx::query_scalar("SELECT COUNT(*) FROM raw_records WHERE ?1 IS NULL OR source = ?1")
                .bind(source)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
