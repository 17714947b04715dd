//! Concrete source adapters and the field helpers they share

pub mod coingecko;
pub mod csv_file;
pub mod rss_feed;

pub use coingecko::CoinGeckoAdapter;
pub use csv_file::CsvFileAdapter;
pub use rss_feed::FeedAdapter;

use crate::config::EtlConfig;
use crate::error::{EtlError, EtlResult};
use crate::ingest::adapter::SourceAdapter;
use crate::ingest::failure::FailureKind;
use crate::ingest::rate_limiter::TokenBucket;
use crate::ingest::types::RawRecord;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use reqwest::StatusCode;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Per-request timeout for HTTP sources
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// An adapter together with the limiter that gates its network calls
pub struct SourceRegistration {
    pub adapter: Arc<dyn SourceAdapter>,
    pub limiter: Option<Arc<TokenBucket>>,
}

/// Adapters for every source the configuration describes
pub fn from_config(config: &EtlConfig) -> EtlResult<Vec<SourceRegistration>> {
    let client = http_client()?;

    Ok(vec![
        SourceRegistration {
            adapter: Arc::new(CoinGeckoAdapter::new(client.clone(), &config.coingecko)),
            limiter: Some(Arc::new(TokenBucket::per_minute(config.coingecko.calls_per_minute)?)),
        },
        SourceRegistration {
            adapter: Arc::new(CsvFileAdapter::new(&config.csv.path)),
            limiter: None,
        },
        SourceRegistration {
            adapter: Arc::new(FeedAdapter::new(client, &config.feed.url)),
            limiter: Some(Arc::new(TokenBucket::per_minute(config.feed.calls_per_minute)?)),
        },
    ])
}

pub fn http_client() -> EtlResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .user_agent(concat!("cdp-etl/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| EtlError::Config(format!("Failed to build HTTP client: {}", e)))
}

/// Classify a transport-level failure
pub(crate) fn request_error(err: reqwest::Error) -> EtlError {
    if err.is_timeout() {
        EtlError::transient(FailureKind::Timeout, err.to_string())
    } else if err.is_decode() {
        EtlError::orchestration(format!("Malformed response body: {}", err))
    } else if let Some(status) = err.status() {
        status_error(status)
    } else {
        EtlError::transient(FailureKind::Network, err.to_string())
    }
}

/// Classify a non-success HTTP status: 429 throttles, 408 and 5xx are
/// transient, any other client error is permanent
pub(crate) fn status_error(status: StatusCode) -> EtlError {
    let message = format!("upstream returned {}", status);
    match status {
        StatusCode::TOO_MANY_REQUESTS => EtlError::transient(FailureKind::Throttle, message),
        StatusCode::REQUEST_TIMEOUT => EtlError::transient(FailureKind::Timeout, message),
        s if s.is_server_error() => EtlError::transient(FailureKind::Network, message),
        _ => EtlError::orchestration(message),
    }
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        },
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Non-empty text (strings, or numbers rendered as text)
pub(crate) fn required_str(raw: &RawRecord, field: &str) -> EtlResult<String> {
    optional_str(raw, field)
        .ok_or_else(|| EtlError::validation(format!("missing required field '{}'", field)))
}

pub(crate) fn optional_str(raw: &RawRecord, field: &str) -> Option<String> {
    raw.get(field).and_then(value_as_text)
}

/// Decimal from a JSON number or numeric string. Absent, null and empty are `None`.
pub(crate) fn optional_decimal(raw: &RawRecord, field: &str) -> EtlResult<Option<BigDecimal>> {
    optional_str(raw, field)
        .map(|text| {
            BigDecimal::from_str(&text).map_err(|_| {
                EtlError::validation(format!("field '{}' is not a number: {}", field, text))
            })
        })
        .transpose()
}

pub(crate) fn required_decimal(raw: &RawRecord, field: &str) -> EtlResult<BigDecimal> {
    optional_decimal(raw, field)?
        .ok_or_else(|| EtlError::validation(format!("missing required field '{}'", field)))
}

/// RFC 3339, or a naive date/time taken as UTC
pub(crate) fn parse_timestamp(text: &str) -> EtlResult<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Some(midnight) = NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return Ok(midnight.and_utc());
    }

    Err(EtlError::validation(format!("unparseable timestamp: {}", text)))
}

pub(crate) fn required_timestamp(raw: &RawRecord, field: &str) -> EtlResult<DateTime<Utc>> {
    parse_timestamp(&required_str(raw, field)?)
}

pub(crate) fn schema(fields: &[&str]) -> std::collections::BTreeSet<String> {
    fields.iter().map(|f| f.to_string()).collect()
}
