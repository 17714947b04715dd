//! ETL configuration
//!
//! Loaded from `.env` and environment variables on top of the defaults below.

use crate::ingest::failure::{FailureInjector, FailureKind};
use crate::ingest::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_DATABASE_URL: &str = "sqlite://cdp.db?mode=rwc";
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_COINGECKO_BASE_URL: &str = "https://api.coingecko.com/api/v3";
/// Calls per minute
pub const DEFAULT_COINGECKO_RATE_LIMIT: u32 = 30;
pub const DEFAULT_COINGECKO_PER_PAGE: u32 = 100;

pub const DEFAULT_CSV_PATH: &str = "data/crypto_data.csv";

pub const DEFAULT_RSS_FEED_URL: &str = "https://rss.app/feeds/v1.1/tRI0JxEaEvcKz0HW.json";
/// Calls per minute
pub const DEFAULT_RSS_RATE_LIMIT: u32 = 20;

pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 2_000;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 10_000;

pub const DEFAULT_SCHEDULE_SECS: u64 = 3_600;
/// A `running` checkpoint older than this may be taken over by a new run
pub const DEFAULT_STALE_RUN_SECS: u64 = 1_800;
pub const DEFAULT_DRIFT_SAMPLE_SIZE: usize = 10;
pub const DEFAULT_PRIMARY_SOURCE: &str = "coingecko";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlConfig {
    pub database: DatabaseConfig,
    pub coingecko: CoinGeckoConfig,
    pub csv: CsvConfig,
    pub feed: FeedConfig,
    pub retry: RetryConfig,
    pub runner: RunnerConfig,
    pub failure_injection: FailureInjectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinGeckoConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub calls_per_minute: u32,
    pub per_page: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub url: String,
    pub calls_per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub schedule_secs: u64,
    pub stale_run_secs: u64,
    pub drift_sample_size: usize,
    pub primary_source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInjectionConfig {
    pub enabled: bool,
    pub probability: f64,
    /// 1-based position in the fetched batch, so `FAIL_AT_RECORD=1` fails the first record
    pub fail_at_record: Option<usize>,
    pub kind: FailureKind,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl EtlConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = EtlConfig {
            database: DatabaseConfig {
                url: env_string("DATABASE_URL", DEFAULT_DATABASE_URL),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
            },
            coingecko: CoinGeckoConfig {
                base_url: env_string("COINGECKO_BASE_URL", DEFAULT_COINGECKO_BASE_URL),
                api_key: env_optional("COINGECKO_API_KEY"),
                calls_per_minute: env_or("COINGECKO_RATE_LIMIT", DEFAULT_COINGECKO_RATE_LIMIT),
                per_page: env_or("COINGECKO_PER_PAGE", DEFAULT_COINGECKO_PER_PAGE),
            },
            csv: CsvConfig {
                path: PathBuf::from(env_string("CSV_PATH", DEFAULT_CSV_PATH)),
            },
            feed: FeedConfig {
                url: env_string("RSS_FEED_URL", DEFAULT_RSS_FEED_URL),
                calls_per_minute: env_or("RSS_RATE_LIMIT", DEFAULT_RSS_RATE_LIMIT),
            },
            retry: RetryConfig {
                max_attempts: env_or("ETL_RETRY_MAX_ATTEMPTS", DEFAULT_RETRY_MAX_ATTEMPTS),
                base_delay_ms: env_or("ETL_RETRY_BASE_DELAY_MS", DEFAULT_RETRY_BASE_DELAY_MS),
                max_delay_ms: env_or("ETL_RETRY_MAX_DELAY_MS", DEFAULT_RETRY_MAX_DELAY_MS),
            },
            runner: RunnerConfig {
                schedule_secs: env_or("ETL_SCHEDULE_SECS", DEFAULT_SCHEDULE_SECS),
                stale_run_secs: env_or("ETL_STALE_RUN_SECS", DEFAULT_STALE_RUN_SECS),
                drift_sample_size: env_or("ETL_DRIFT_SAMPLE_SIZE", DEFAULT_DRIFT_SAMPLE_SIZE),
                primary_source: env_string("ETL_PRIMARY_SOURCE", DEFAULT_PRIMARY_SOURCE),
            },
            failure_injection: FailureInjectionConfig {
                enabled: env_or("ENABLE_FAILURE_INJECTION", false),
                probability: env_or("FAILURE_PROBABILITY", 0.0),
                fail_at_record: env_optional("FAIL_AT_RECORD").and_then(|s| s.trim().parse().ok()),
                kind: env_or("FAILURE_KIND", FailureKind::Network),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max connections must be greater than 0");
        }
        if self.coingecko.calls_per_minute == 0 || self.feed.calls_per_minute == 0 {
            anyhow::bail!("Source rate limits must be greater than 0 calls per minute");
        }
        if self.coingecko.per_page == 0 || self.coingecko.per_page > 250 {
            anyhow::bail!("COINGECKO_PER_PAGE must be between 1 and 250");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("ETL_RETRY_MAX_ATTEMPTS must be at least 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            anyhow::bail!("ETL_RETRY_BASE_DELAY_MS cannot exceed ETL_RETRY_MAX_DELAY_MS");
        }
        if self.runner.schedule_secs == 0 {
            anyhow::bail!("ETL_SCHEDULE_SECS must be greater than 0");
        }
        if self.runner.stale_run_secs == 0 {
            anyhow::bail!("ETL_STALE_RUN_SECS must be greater than 0");
        }
        if self.runner.drift_sample_size == 0 {
            anyhow::bail!("ETL_DRIFT_SAMPLE_SIZE must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.failure_injection.probability) {
            anyhow::bail!("FAILURE_PROBABILITY must be between 0.0 and 1.0");
        }
        if self.failure_injection.fail_at_record == Some(0) {
            anyhow::bail!("FAIL_AT_RECORD is 1-based and must be at least 1");
        }

        Ok(())
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl RunnerConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_run_secs)
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_secs)
    }
}

impl FailureInjectionConfig {
    /// `None` when injection is disabled, so the runner carries no injector at all
    pub fn injector(&self) -> Option<FailureInjector> {
        self.enabled.then(|| {
            let fail_at_index = self.fail_at_record.map(|n| n.saturating_sub(1));
            FailureInjector::new(self.probability, fail_at_index, self.kind)
        })
    }
}
