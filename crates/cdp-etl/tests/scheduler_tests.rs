//! Interval scheduler behaviour

mod common;

use anyhow::Result;
use cdp_etl::ingest::{CheckpointStatus, Scheduler};
use common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn run_for(scheduler: Scheduler, period: Duration) -> Result<usize> {
    let shutdown = CancellationToken::new();
    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };
    tokio::time::sleep(period).await;
    shutdown.cancel();
    Ok(task.await?)
}

#[tokio::test]
async fn test_every_source_runs_each_tick() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let alpha = Arc::new(StubAdapter::new("alpha", coins(0..3)));
    let beta = Arc::new(StubAdapter::new("beta", coins(0..2)));
    let runner = Arc::new(runner_with(&pool, vec![Arc::clone(&alpha), Arc::clone(&beta)]));

    let completed = run_for(
        Scheduler::new(Arc::clone(&runner), Duration::from_millis(50)),
        Duration::from_millis(280),
    )
    .await?;

    assert!(alpha.fetch_count() >= 2, "alpha fetched {}", alpha.fetch_count());
    assert!(beta.fetch_count() >= 2, "beta fetched {}", beta.fetch_count());
    assert!(completed >= 4);
    assert_eq!(runner.records().count(None).await?, 5);
    for checkpoint in runner.list_checkpoints().await? {
        assert_eq!(checkpoint.status, CheckpointStatus::Success);
    }
    Ok(())
}

#[tokio::test]
async fn test_slow_source_is_never_run_twice_at_once() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let slow = Arc::new(
        StubAdapter::new("slow", coins(0..2)).fetch_delay(Duration::from_millis(120)),
    );
    let runner = Arc::new(runner_with(&pool, vec![Arc::clone(&slow)]));

    run_for(
        Scheduler::new(Arc::clone(&runner), Duration::from_millis(20)),
        Duration::from_millis(400),
    )
    .await?;

    assert_eq!(slow.max_concurrent_fetches(), 1);
    assert!(slow.fetch_count() >= 2);
    // a run interrupted by shutdown releases its checkpoint
    let checkpoint = runner.get_checkpoint("slow").await?;
    assert_ne!(checkpoint.status, CheckpointStatus::Running);
    assert!(checkpoint.current_run_id.is_none());
    Ok(())
}

#[tokio::test]
async fn test_failing_source_does_not_stop_the_loop() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let broken = Arc::new(StubAdapter::new("broken", coins(0..1)).failing_first(u32::MAX));
    let healthy = Arc::new(StubAdapter::new("healthy", coins(0..1)));
    let runner = Arc::new(runner_with(&pool, vec![Arc::clone(&broken), Arc::clone(&healthy)]));

    run_for(
        Scheduler::new(Arc::clone(&runner), Duration::from_millis(60)),
        Duration::from_millis(300),
    )
    .await?;

    // each failed run makes three attempts
    assert!(broken.fetch_count() >= 6, "broken fetched {}", broken.fetch_count());
    assert!(healthy.fetch_count() >= 2);
    assert_eq!(runner.get_checkpoint("healthy").await?.status, CheckpointStatus::Success);

    let failed = runner.list_runs(Some("broken"), 10).await?;
    assert!(failed.len() >= 2);
    Ok(())
}
