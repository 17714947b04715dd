//! CDP ETL - ingestion worker and inspection tool

use anyhow::{Context, Result};
use cdp_common::logging::{init_logging, LogConfig, LogLevel};
use cdp_etl::config::EtlConfig;
use cdp_etl::db;
use cdp_etl::ingest::{IngestionRunner, RunRecord, Scheduler};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "cdp-etl")]
#[command(author, version, about = "CDP market data ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one ingestion pass for a source, or for every source when omitted
    Run {
        /// Source name (coingecko, csv, rss_feed)
        source: Option<String>,
    },

    /// Run every source on an interval until interrupted
    Schedule {
        /// Seconds between ticks (defaults to ETL_SCHEDULE_SECS)
        #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
        interval: Option<u64>,
    },

    /// Show checkpoints
    Status {
        /// Only this source
        source: Option<String>,
    },

    /// List recent runs
    Runs {
        #[arg(short, long)]
        source: Option<String>,

        #[arg(short, long, default_value_t = 20)]
        limit: i64,
    },

    /// List recent schema drift observations
    Drift {
        #[arg(short, long)]
        source: Option<String>,

        #[arg(short, long, default_value_t = 20)]
        limit: i64,
    },

    /// Link stored records that have no master entity yet
    BackfillEntities,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over flags
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("cdp-etl")
        .filter_directives("sqlx=warn")
        .build()
        .merge_env()?;
    let _guard = init_logging(&log_config)?;

    let config = EtlConfig::load().context("Failed to load configuration")?;
    let pool = db::connect(&config.database)
        .await
        .context("Failed to open database")?;
    let runner = IngestionRunner::from_config(pool, &config)?;

    match cli.command {
        Command::Run { source: Some(source) } => {
            let shutdown = CancellationToken::new();
            spawn_ctrl_c(shutdown.clone());

            let run = runner
                .run_with_cancellation(&source, shutdown)
                .await
                .with_context(|| format!("Run for {} failed", source))?;
            print_run(&run);
        },
        Command::Run { source: None } => {
            let shutdown = CancellationToken::new();
            spawn_ctrl_c(shutdown.clone());

            let mut failures = 0;
            for (source, result) in runner.run_all(shutdown).await {
                match result {
                    Ok(run) => print_run(&run),
                    Err(e) => {
                        failures += 1;
                        println!("{} failed: {}", source, e);
                    },
                }
            }
            if failures > 0 {
                anyhow::bail!("{} source(s) failed", failures);
            }
        },
        Command::Schedule { interval } => {
            let interval = interval
                .map(std::time::Duration::from_secs)
                .unwrap_or_else(|| config.runner.schedule_interval());
            let shutdown = CancellationToken::new();
            spawn_ctrl_c(shutdown.clone());

            let scheduler = Scheduler::new(Arc::new(runner), interval);
            scheduler.run(shutdown).await;
        },
        Command::Status { source } => {
            let checkpoints = match source {
                Some(source) => vec![runner.get_checkpoint(&source).await?],
                None => runner.list_checkpoints().await?,
            };
            if checkpoints.is_empty() {
                println!("No checkpoints yet");
            }
            for cp in checkpoints {
                println!(
                    "{:<12} {:<8} cursor={:<16} processed={:<6} last_completed={} {}",
                    cp.source,
                    cp.status.as_str(),
                    cp.cursor.as_deref().unwrap_or("-"),
                    cp.records_processed,
                    cp.last_run_completed_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string()),
                    cp.error_message.as_deref().unwrap_or(""),
                );
            }
            for (source, count) in runner.record_counts().await? {
                println!("{:<12} {} records", source, count);
            }
        },
        Command::Runs { source, limit } => {
            for run in runner.list_runs(source.as_deref(), limit).await? {
                println!(
                    "{} {:<12} {:<9} processed={:<6} failed={:<4} started={} duration_ms={} {}",
                    run.run_id,
                    run.source,
                    run.status.as_str(),
                    run.records_processed,
                    run.records_failed,
                    run.started_at.to_rfc3339(),
                    run.duration
                        .map(|d| d.as_millis().to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    run.error_message.as_deref().unwrap_or(""),
                );
            }
        },
        Command::Drift { source, limit } => {
            for obs in runner.get_drift_observations(source.as_deref(), limit).await? {
                println!(
                    "{} {:<12} confidence={:.2} flagged={} samples={} missing={:?} extra={:?} renames={:?}",
                    obs.detected_at.to_rfc3339(),
                    obs.source,
                    obs.confidence_score,
                    obs.flagged,
                    obs.sample_count,
                    obs.missing_fields,
                    obs.extra_fields,
                    obs.fuzzy_renames,
                );
            }
        },
        Command::BackfillEntities => {
            let linked = runner.backfill_entities().await?;
            println!("Linked {} records", linked);
        },
    }

    info!("Done");
    Ok(())
}

fn print_run(run: &RunRecord) {
    println!(
        "{} run {}: {} processed, {} failed ({})",
        run.source, run.run_id, run.records_processed, run.records_failed, run.status
    );
}

fn spawn_ctrl_c(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                shutdown.cancel();
            },
            Err(e) => warn!(error = %e, "Failed to listen for interrupt"),
        }
    });
}
