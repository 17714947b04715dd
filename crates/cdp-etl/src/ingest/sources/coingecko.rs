//! CoinGecko `/coins/markets` adapter
//!
//! The cursor is the 1-based page number. A full page moves the cursor to the
//! next page; a short page keeps it, so the next run re-reads the same page
//! and picks up coins appended since.

use super::{
    optional_decimal, optional_str, request_error, required_decimal, required_str,
    required_timestamp, schema, status_error,
};
use crate::config::CoinGeckoConfig;
use crate::error::{EtlError, EtlResult};
use crate::ingest::adapter::SourceAdapter;
use crate::ingest::types::{FetchedBatch, NormalizedRecord, RawRecord};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

pub const SOURCE_NAME: &str = "coingecko";
const API_KEY_HEADER: &str = "x-cg-demo-api-key";

pub struct CoinGeckoAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    per_page: u32,
    vs_currency: String,
}

impl CoinGeckoAdapter {
    pub fn new(client: reqwest::Client, config: &CoinGeckoConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            per_page: config.per_page.max(1),
            vs_currency: "usd".to_string(),
        }
    }

    pub fn per_page(&self) -> u32 {
        self.per_page
    }

    /// Unparseable cursors restart from the first page
    fn page_from_cursor(cursor: Option<&str>) -> u32 {
        let Some(c) = cursor else {
            return 1;
        };
        match c.trim().parse::<u32>() {
            Ok(page) if page >= 1 => page,
            _ => {
                warn!(source = SOURCE_NAME, cursor = c, "Ignoring invalid page cursor");
                1
            },
        }
    }

    /// A full page moves on; a short one is re-read next time
    fn next_page(page: u32, fetched: usize, per_page: u32) -> u32 {
        if fetched >= per_page as usize {
            page.saturating_add(1)
        } else {
            page
        }
    }
}

#[async_trait]
impl SourceAdapter for CoinGeckoAdapter {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn fetch(&self, cursor: Option<&str>) -> EtlResult<FetchedBatch> {
        let page = Self::page_from_cursor(cursor);
        let url = format!("{}/coins/markets", self.base_url);
        debug!(url = %url, page, per_page = self.per_page, "Requesting market data");

        let mut request = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&[
                ("vs_currency", self.vs_currency.as_str()),
                ("order", "market_cap_desc"),
                ("sparkline", "false"),
                ("price_change_percentage", "24h"),
            ])
            .query(&[("per_page", self.per_page), ("page", page)]);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send().await.map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status));
        }

        let body: Value = response.json().await.map_err(request_error)?;
        let Value::Array(items) = body else {
            return Err(EtlError::orchestration(
                "unexpected /coins/markets response: expected a JSON array",
            ));
        };

        let records: Vec<RawRecord> = items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();

        let next_page = Self::next_page(page, records.len(), self.per_page);
        info!(source = SOURCE_NAME, page, count = records.len(), next_page, "Fetched market page");

        Ok(FetchedBatch::new(records, Some(next_page.to_string())))
    }

    fn normalize(&self, raw: &RawRecord) -> EtlResult<NormalizedRecord> {
        Ok(NormalizedRecord {
            source: SOURCE_NAME.to_string(),
            external_id: required_str(raw, "id")?,
            symbol: required_str(raw, "symbol")?.to_uppercase(),
            display_name: optional_str(raw, "name"),
            numeric_value: required_decimal(raw, "current_price")?,
            secondary_numeric: optional_decimal(raw, "market_cap")?,
            tertiary_numeric: optional_decimal(raw, "total_volume")?,
            delta_numeric: optional_decimal(raw, "price_change_percentage_24h")?,
            observed_at: required_timestamp(raw, "last_updated")?,
        })
    }

    fn expected_schema(&self) -> BTreeSet<String> {
        schema(&[
            "id",
            "symbol",
            "name",
            "current_price",
            "market_cap",
            "total_volume",
            "price_change_percentage_24h",
            "last_updated",
        ])
    }
}
