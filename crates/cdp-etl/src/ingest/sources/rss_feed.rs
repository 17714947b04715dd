//! JSON Feed news adapter
//!
//! Items arrive newest first. The cursor is the id of the newest item already
//! ingested; a fetch stops as soon as it reaches that id. News items share the
//! pseudo-symbol `NEWS` and carry zero numeric values.

use super::{optional_str, request_error, required_str, required_timestamp, schema, status_error};
use crate::error::{EtlError, EtlResult};
use crate::ingest::adapter::SourceAdapter;
use crate::ingest::types::{FetchedBatch, NormalizedRecord, RawRecord};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, info};

pub const SOURCE_NAME: &str = "rss_feed";
pub const NEWS_SYMBOL: &str = "NEWS";
const MAX_TITLE_CHARS: usize = 100;

pub struct FeedAdapter {
    client: reqwest::Client,
    url: String,
}

impl FeedAdapter {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

fn item_id(item: &RawRecord) -> Option<String> {
    optional_str(item, "id")
}

#[async_trait]
impl SourceAdapter for FeedAdapter {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn fetch(&self, cursor: Option<&str>) -> EtlResult<FetchedBatch> {
        debug!(url = %self.url, cursor = ?cursor, "Requesting feed");

        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/feed+json, application/json")
            .send()
            .await
            .map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status));
        }

        let body: Value = response.json().await.map_err(request_error)?;
        let items = match body.get("items") {
            Some(Value::Array(items)) => items,
            Some(_) => return Err(EtlError::orchestration("feed 'items' is not an array")),
            None => return Ok(FetchedBatch::empty()),
        };

        let records: Vec<RawRecord> = items
            .iter()
            .filter_map(|item| item.as_object().cloned())
            .take_while(|item| match (cursor, item_id(item)) {
                (Some(seen), Some(id)) => id != seen,
                _ => true,
            })
            .collect();

        let next_cursor = records.first().and_then(item_id);
        info!(
            source = SOURCE_NAME,
            count = records.len(),
            has_cursor = cursor.is_some(),
            "Fetched feed items"
        );

        Ok(FetchedBatch::new(records, next_cursor))
    }

    fn normalize(&self, raw: &RawRecord) -> EtlResult<NormalizedRecord> {
        let title = required_str(raw, "title")?;
        let zero = BigDecimal::from(0);

        Ok(NormalizedRecord {
            source: SOURCE_NAME.to_string(),
            external_id: required_str(raw, "id")?,
            symbol: NEWS_SYMBOL.to_string(),
            display_name: Some(title.chars().take(MAX_TITLE_CHARS).collect()),
            numeric_value: zero.clone(),
            secondary_numeric: Some(zero.clone()),
            tertiary_numeric: Some(zero.clone()),
            delta_numeric: Some(zero),
            observed_at: required_timestamp(raw, "date_published")?,
        })
    }

    fn expected_schema(&self) -> BTreeSet<String> {
        schema(&[
            "id",
            "url",
            "title",
            "content_text",
            "date_published",
            "authors",
            "image",
        ])
    }
}
