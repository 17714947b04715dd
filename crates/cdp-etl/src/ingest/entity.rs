//! Master entity resolution
//!
//! Records from different sources that share a canonical symbol are linked to
//! one master entity. Entities are created lazily on first sight of a symbol.

use crate::error::{EtlError, EtlResult};
use crate::ingest::types::{EntityMapping, MasterEntity};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, info};

/// Canonical names for well-known symbols
pub const KNOWN_SYMBOLS: &[(&str, &str)] = &[
    ("BTC", "Bitcoin"),
    ("ETH", "Ethereum"),
    ("BNB", "Binance Coin"),
    ("XRP", "XRP"),
    ("ADA", "Cardano"),
    ("SOL", "Solana"),
    ("DOGE", "Dogecoin"),
    ("DOT", "Polkadot"),
    ("MATIC", "Polygon"),
    ("AVAX", "Avalanche"),
];

pub fn canonical_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

/// Known-symbol name, else the observed display name, else the symbol itself
pub fn canonical_name(canonical_symbol: &str, display_name: Option<&str>) -> String {
    KNOWN_SYMBOLS
        .iter()
        .find(|(symbol, _)| *symbol == canonical_symbol)
        .map(|(_, name)| (*name).to_string())
        .or_else(|| {
            display_name
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| canonical_symbol.to_string())
}

#[derive(Debug, Clone)]
pub struct EntityResolver {
    pool: SqlitePool,
    priority_source: String,
}

impl EntityResolver {
    pub fn new(pool: SqlitePool, priority_source: impl Into<String>) -> Self {
        Self {
            pool,
            priority_source: priority_source.into(),
        }
    }

    pub fn priority_source(&self) -> &str {
        &self.priority_source
    }

    /// Link `record_id` to the master entity for `symbol`, creating it if needed
    pub async fn resolve(
        &self,
        symbol: &str,
        display_name: Option<&str>,
        source: &str,
        record_id: i64,
    ) -> EtlResult<i64> {
        self.resolve_with_confidence(symbol, display_name, source, record_id, 1.0)
            .await
    }

    pub async fn resolve_with_confidence(
        &self,
        symbol: &str,
        display_name: Option<&str>,
        source: &str,
        record_id: i64,
        confidence: f64,
    ) -> EtlResult<i64> {
        let symbol = canonical_symbol(symbol);
        if symbol.is_empty() {
            return Err(EtlError::validation(format!(
                "record {} has an empty symbol",
                record_id
            )));
        }

        let now = Utc::now();
        let is_priority = source == self.priority_source;
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query(
            r#"
            INSERT INTO master_entities (
                canonical_symbol, canonical_name, primary_source, primary_record_id,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT(canonical_symbol) DO NOTHING
            "#,
        )
        .bind(&symbol)
        .bind(canonical_name(&symbol, display_name))
        .bind(source)
        .bind(record_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        let entity = sqlx::query_as::<_, MasterEntity>(
            "SELECT * FROM master_entities WHERE canonical_symbol = ?1",
        )
        .bind(&symbol)
        .fetch_one(&mut *tx)
        .await?;

        if created {
            info!(
                master_entity_id = entity.id,
                symbol = %symbol,
                name = %entity.canonical_name,
                source,
                "Created master entity"
            );
        } else if is_priority && entity.primary_source != self.priority_source {
            sqlx::query(
                r#"
                UPDATE master_entities
                SET primary_source = ?2, primary_record_id = ?3, updated_at = ?4
                WHERE id = ?1
                "#,
            )
            .bind(entity.id)
            .bind(source)
            .bind(record_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            info!(
                master_entity_id = entity.id,
                symbol = %symbol,
                previous = %entity.primary_source,
                source,
                "Promoted priority source to primary"
            );
        }

        sqlx::query(
            r#"
            INSERT INTO entity_mappings (
                master_entity_id, record_id, source, confidence, is_primary, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(record_id) DO UPDATE SET
                master_entity_id = excluded.master_entity_id,
                confidence = excluded.confidence,
                is_primary = excluded.is_primary
            "#,
        )
        .bind(entity.id)
        .bind(record_id)
        .bind(source)
        .bind(confidence.clamp(0.0, 1.0))
        .bind(is_priority)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(master_entity_id = entity.id, record_id, source, "Record mapped");

        Ok(entity.id)
    }

    /// Map every stored record that has no mapping yet. Returns how many were linked.
    pub async fn backfill(&self) -> EtlResult<usize> {
        let unmapped = sqlx::query_as::<_, (i64, String, Option<String>, String)>(
            r#"
            SELECT r.id, r.symbol, r.display_name, r.source
            FROM normalized_records r
            LEFT JOIN entity_mappings m ON m.record_id = r.id
            WHERE m.id IS NULL
            ORDER BY r.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let total = unmapped.len();
        for (record_id, symbol, display_name, source) in unmapped {
            self.resolve(&symbol, display_name.as_deref(), &source, record_id)
                .await?;
        }

        info!(linked = total, "Entity backfill complete");
        Ok(total)
    }

    pub async fn get_entity(&self, symbol: &str) -> EtlResult<Option<MasterEntity>> {
        let entity = sqlx::query_as::<_, MasterEntity>(
            "SELECT * FROM master_entities WHERE canonical_symbol = ?1",
        )
        .bind(canonical_symbol(symbol))
        .fetch_optional(&self.pool)
        .await?;
        Ok(entity)
    }

    pub async fn list_entities(&self) -> EtlResult<Vec<MasterEntity>> {
        let entities =
            sqlx::query_as::<_, MasterEntity>("SELECT * FROM master_entities ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(entities)
    }

    pub async fn mappings_for(&self, master_entity_id: i64) -> EtlResult<Vec<EntityMapping>> {
        let mappings = sqlx::query_as::<_, EntityMapping>(
            "SELECT * FROM entity_mappings WHERE master_entity_id = ?1 ORDER BY record_id",
        )
        .bind(master_entity_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(mappings)
    }

    pub async fn mapping_for_record(&self, record_id: i64) -> EtlResult<Option<EntityMapping>> {
        let mapping = sqlx::query_as::<_, EntityMapping>(
            "SELECT * FROM entity_mappings WHERE record_id = ?1",
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(mapping)
    }
}
