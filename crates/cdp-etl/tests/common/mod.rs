//! Shared helpers for cdp-etl integration tests
//!
//! - In-memory database setup
//! - A scriptable in-process source adapter
//! - Raw record builders

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use cdp_etl::error::{EtlError, EtlResult};
use cdp_etl::ingest::{
    FailureKind, FetchedBatch, IngestionRunner, NormalizedRecord, RawRecord, RetryPolicy,
    RunnerBuilder, SourceAdapter,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("cdp_etl=debug,sqlx=warn")
        .try_init();
}

pub async fn test_pool() -> SqlitePool {
    cdp_etl::db::connect_in_memory()
        .await
        .expect("Failed to create in-memory database")
}

/// Retries quickly so tests don't wait on production backoff
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
    }
}

pub fn runner_builder(pool: &SqlitePool) -> RunnerBuilder {
    IngestionRunner::builder(pool.clone()).retry_policy(fast_retry())
}

pub fn runner_with(pool: &SqlitePool, adapters: Vec<Arc<StubAdapter>>) -> IngestionRunner {
    adapters
        .into_iter()
        .fold(runner_builder(pool), |builder, adapter| {
            builder.source(adapter, None)
        })
        .build()
}

pub fn raw(value: Value) -> RawRecord {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Well-formed record `rec-{i}`
pub fn coin(i: usize, symbol: &str) -> RawRecord {
    raw(json!({
        "id": format!("rec-{i}"),
        "symbol": symbol,
        "name": format!("{symbol} coin"),
        "price": 100.0 + i as f64,
        "observed_at": "2025-01-15T12:00:00Z",
    }))
}

/// Record without a price; fails normalization
pub fn invalid(i: usize) -> RawRecord {
    raw(json!({
        "id": format!("rec-{i}"),
        "symbol": "BAD",
        "name": "broken",
        "observed_at": "2025-01-15T12:00:00Z",
    }))
}

pub fn coins(range: std::ops::Range<usize>) -> Vec<RawRecord> {
    range.map(|i| coin(i, &format!("C{i}"))).collect()
}

/// In-process adapter serving a fixed list of records, `page_size` at a time.
///
/// The cursor is the offset of the next record.
pub struct StubAdapter {
    name: String,
    records: Mutex<Vec<RawRecord>>,
    page_size: usize,
    transient_failures: AtomicU32,
    fetch_delay: Option<Duration>,
    fetches: AtomicU32,
    active: AtomicU32,
    max_active: AtomicU32,
}

impl StubAdapter {
    pub fn new(name: &str, records: Vec<RawRecord>) -> Self {
        Self {
            name: name.to_string(),
            records: Mutex::new(records),
            page_size: usize::MAX,
            transient_failures: AtomicU32::new(0),
            fetch_delay: None,
            fetches: AtomicU32::new(0),
            active: AtomicU32::new(0),
            max_active: AtomicU32::new(0),
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Fail the next `count` fetches with a transient network error
    pub fn failing_first(self, count: u32) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub fn push(&self, records: impl IntoIterator<Item = RawRecord>) {
        self.records.lock().unwrap().extend(records);
    }

    pub fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Highest number of fetches observed in flight at once
    pub fn max_concurrent_fetches(&self) -> u32 {
        self.max_active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a AtomicU32);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceAdapter for StubAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, cursor: Option<&str>) -> EtlResult<FetchedBatch> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }

        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(EtlError::transient(FailureKind::Network, "connection reset"));
        }

        let offset = cursor.map(|c| c.parse::<usize>().unwrap()).unwrap_or(0);
        let records = self.records.lock().unwrap();
        let page: Vec<RawRecord> = records
            .iter()
            .skip(offset)
            .take(self.page_size)
            .cloned()
            .collect();
        let next = offset + page.len();

        Ok(FetchedBatch::new(page, Some(next.to_string())))
    }

    fn normalize(&self, raw: &RawRecord) -> EtlResult<NormalizedRecord> {
        let text = |field: &str| raw.get(field).and_then(Value::as_str).map(str::to_string);

        let external_id = text("id").ok_or_else(|| EtlError::validation("missing id"))?;
        let symbol = text("symbol").ok_or_else(|| EtlError::validation("missing symbol"))?;
        let price = raw
            .get("price")
            .and_then(Value::as_f64)
            .ok_or_else(|| EtlError::validation(format!("{external_id}: missing price")))?;
        let observed_at = text("observed_at")
            .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(NormalizedRecord {
            source: self.name.clone(),
            external_id,
            symbol,
            display_name: text("name"),
            numeric_value: BigDecimal::from_str(&price.to_string()).unwrap(),
            secondary_numeric: None,
            tertiary_numeric: None,
            delta_numeric: None,
            observed_at,
        })
    }

    fn expected_schema(&self) -> BTreeSet<String> {
        ["id", "symbol", "name", "price", "observed_at"]
            .into_iter()
            .map(String::from)
            .collect()
    }
}
