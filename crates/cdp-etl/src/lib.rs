//! CDP ETL library
//!
//! Checkpointed, idempotent ingestion of crypto market data from several
//! sources into SQLite.
//!
//! # Sources
//!
//! - **coingecko**: `/coins/markets`, paginated by page number
//! - **csv**: local CSV export, paginated by row offset
//! - **rss_feed**: JSON Feed news items, resumed from the newest seen item
//!
//! # Example
//!
//! ```no_run
//! use cdp_etl::{config::EtlConfig, db, ingest::IngestionRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EtlConfig::load()?;
//!     let pool = db::connect(&config.database).await?;
//!     let runner = IngestionRunner::from_config(pool, &config)?;
//!     let run = runner.run("coingecko").await?;
//!     println!("{} records", run.records_processed);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod db;
pub mod error;
pub mod ingest;

pub use error::{EtlError, EtlResult};
