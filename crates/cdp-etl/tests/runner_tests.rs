//! End-to-end ingestion runs against an in-memory database

mod common;

use anyhow::Result;
use cdp_etl::config::FailureInjectionConfig;
use cdp_etl::error::EtlError;
use cdp_etl::ingest::{CheckpointStatus, FailureInjector, FailureKind, RunStatus, TokenBucket};
use common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_run_persists_full_batch() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let adapter = Arc::new(StubAdapter::new("alpha", coins(0..100)));
    let runner = runner_with(&pool, vec![adapter]);

    let run = runner.run("alpha").await?;

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.records_processed, 100);
    assert_eq!(run.records_failed, 0);
    assert!(run.duration.is_some());

    let checkpoint = runner.get_checkpoint("alpha").await?;
    assert_eq!(checkpoint.status, CheckpointStatus::Success);
    assert_eq!(checkpoint.cursor.as_deref(), Some("100"));
    assert_eq!(checkpoint.records_processed, 100);
    assert!(checkpoint.current_run_id.is_none());
    assert!(checkpoint.error_message.is_none());

    assert_eq!(runner.records().count(Some("alpha")).await?, 100);
    assert_eq!(runner.records().raw_count(Some("alpha")).await?, 100);
    Ok(())
}

#[tokio::test]
async fn test_invalid_record_is_skipped_not_fatal() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let mut records = coins(0..10);
    records[4] = invalid(4);
    let runner = runner_with(&pool, vec![Arc::new(StubAdapter::new("alpha", records))]);

    let run = runner.run("alpha").await?;

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.records_processed, 9);
    assert_eq!(run.records_failed, 1);
    assert!(runner.records().get("alpha", "rec-4").await?.is_none());
    assert!(runner.records().get("alpha", "rec-5").await?.is_some());
    // the invalid payload is still archived
    assert_eq!(runner.records().raw_count(Some("alpha")).await?, 10);
    Ok(())
}

#[tokio::test]
async fn test_persistence_failure_keeps_checkpoint() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let adapter = Arc::new(StubAdapter::new("alpha", coins(0..20)).page_size(10));
    let runner = runner_with(&pool, vec![adapter]);

    runner.run("alpha").await?;
    assert_eq!(runner.get_checkpoint("alpha").await?.cursor.as_deref(), Some("10"));

    sqlx::query(
        r#"
        CREATE TRIGGER reject_rec_15 BEFORE INSERT ON normalized_records
        WHEN NEW.external_id = 'rec-15'
        BEGIN SELECT RAISE(ABORT, 'disk full'); END
        "#,
    )
    .execute(&pool)
    .await?;

    let err = runner.run("alpha").await.unwrap_err();
    assert!(matches!(err, EtlError::Persistence(_)), "got {err:?}");

    let checkpoint = runner.get_checkpoint("alpha").await?;
    assert_eq!(checkpoint.status, CheckpointStatus::Failed);
    assert_eq!(checkpoint.cursor.as_deref(), Some("10"));
    assert!(checkpoint.error_message.unwrap().contains("disk full"));
    assert!(checkpoint.current_run_id.is_none());
    // nothing from the failed batch survives, raw archive included
    assert_eq!(runner.records().count(Some("alpha")).await?, 10);
    assert_eq!(runner.records().raw_count(Some("alpha")).await?, 10);

    let runs = runner.list_runs(Some("alpha"), 10).await?;
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[1].status, RunStatus::Success);

    // resumes from the last committed cursor once the fault is gone
    sqlx::query("DROP TRIGGER reject_rec_15").execute(&pool).await?;
    let run = runner.run("alpha").await?;
    assert_eq!(run.records_processed, 10);
    assert_eq!(runner.get_checkpoint("alpha").await?.cursor.as_deref(), Some("20"));
    assert_eq!(runner.records().count(Some("alpha")).await?, 20);
    Ok(())
}

#[tokio::test]
async fn test_resume_fetches_only_new_records() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let adapter = Arc::new(StubAdapter::new("alpha", coins(0..5)));
    let runner = runner_with(&pool, vec![Arc::clone(&adapter)]);

    assert_eq!(runner.run("alpha").await?.records_processed, 5);

    adapter.push(coins(5..8));
    let run = runner.run("alpha").await?;

    assert_eq!(run.records_processed, 3);
    assert_eq!(runner.get_checkpoint("alpha").await?.cursor.as_deref(), Some("8"));
    assert_eq!(runner.records().count(Some("alpha")).await?, 8);
    Ok(())
}

#[tokio::test]
async fn test_rerun_without_new_data_is_idempotent() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let records = coins(0..4);

    // a second runner re-reads the same data from the start
    let first = runner_with(&pool, vec![Arc::new(StubAdapter::new("alpha", records.clone()))]);
    first.run("alpha").await?;
    let before = first.records().get("alpha", "rec-2").await?.unwrap();

    sqlx::query("UPDATE checkpoints SET cursor = NULL WHERE source = 'alpha'")
        .execute(&pool)
        .await?;
    let second = runner_with(&pool, vec![Arc::new(StubAdapter::new("alpha", records))]);
    let run = second.run("alpha").await?;

    assert_eq!(run.records_processed, 4);
    assert_eq!(second.records().count(Some("alpha")).await?, 4);

    let after = second.records().get("alpha", "rec-2").await?.unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.ingested_at, before.ingested_at);
    assert_eq!(after.record, before.record);

    // entity links are not duplicated either
    let entity = second.resolver().get_entity("C2").await?.unwrap();
    assert_eq!(second.resolver().mappings_for(entity.id).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_shared_symbol_resolves_to_one_entity() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let alpha = Arc::new(StubAdapter::new("alpha", vec![coin(1, "BTC")]));
    let beta = Arc::new(StubAdapter::new("beta", vec![coin(1, "btc")]));
    let runner = runner_with(&pool, vec![alpha, beta]);

    runner.run("alpha").await?;
    runner.run("beta").await?;

    let entities = runner.resolver().list_entities().await?;
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0].canonical_symbol, "BTC");

    let mappings = runner.resolver().mappings_for(entities[0].id).await?;
    assert_eq!(mappings.len(), 2);
    let sources: Vec<&str> = mappings.iter().map(|m| m.source.as_str()).collect();
    assert!(sources.contains(&"alpha"));
    assert!(sources.contains(&"beta"));
    Ok(())
}

#[tokio::test]
async fn test_failure_after_persistence_does_not_advance_cursor() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let runner = runner_with(&pool, vec![Arc::new(StubAdapter::new("alpha", coins(0..3)))]);

    sqlx::query(
        r#"
        CREATE TRIGGER reject_mappings BEFORE INSERT ON entity_mappings
        BEGIN SELECT RAISE(ABORT, 'mapping store offline'); END
        "#,
    )
    .execute(&pool)
    .await?;

    let err = runner.run("alpha").await.unwrap_err();
    assert!(matches!(err, EtlError::Persistence(_)), "got {err:?}");

    let checkpoint = runner.get_checkpoint("alpha").await?;
    assert_eq!(checkpoint.status, CheckpointStatus::Failed);
    assert!(checkpoint.cursor.is_none());
    // the batch itself was committed before resolution failed
    assert_eq!(runner.records().count(Some("alpha")).await?, 3);

    let runs = runner.list_runs(Some("alpha"), 1).await?;
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[0].records_processed, 3);

    sqlx::query("DROP TRIGGER reject_mappings").execute(&pool).await?;
    runner.run("alpha").await?;
    assert_eq!(runner.records().count(Some("alpha")).await?, 3);
    assert_eq!(runner.get_checkpoint("alpha").await?.cursor.as_deref(), Some("3"));
    Ok(())
}

#[tokio::test]
async fn test_every_fetch_attempt_takes_a_token() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let adapter = Arc::new(StubAdapter::new("alpha", coins(0..3)).failing_first(2));
    // one token up front, then one every 100ms
    let limiter = Arc::new(TokenBucket::new(1, 10.0)?);
    let runner = runner_builder(&pool)
        .source(Arc::clone(&adapter) as _, Some(limiter))
        .build();

    let started = std::time::Instant::now();
    let run = runner.run("alpha").await?;
    let elapsed = started.elapsed();

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(adapter.fetch_count(), 3);
    // the two retries each waited for a refill; backoff alone is well under 100ms
    assert!(elapsed >= Duration::from_millis(180), "elapsed {elapsed:?}");
    Ok(())
}

#[tokio::test]
async fn test_transient_fetch_errors_are_retried() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let adapter = Arc::new(StubAdapter::new("alpha", coins(0..3)).failing_first(2));
    let runner = runner_with(&pool, vec![Arc::clone(&adapter)]);

    let run = runner.run("alpha").await?;

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.records_processed, 3);
    assert_eq!(adapter.fetch_count(), 3);
    Ok(())
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_run() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let adapter = Arc::new(StubAdapter::new("alpha", coins(0..3)).failing_first(10));
    let runner = runner_with(&pool, vec![Arc::clone(&adapter)]);

    let err = runner.run("alpha").await.unwrap_err();

    assert!(err.is_transient());
    assert_eq!(adapter.fetch_count(), 3);
    let checkpoint = runner.get_checkpoint("alpha").await?;
    assert_eq!(checkpoint.status, CheckpointStatus::Failed);
    assert!(checkpoint.cursor.is_none());
    assert_eq!(runner.records().count(None).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_injected_validation_failure_skips_one_record() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let runner = runner_builder(&pool)
        .source(Arc::new(StubAdapter::new("alpha", coins(0..10))), None)
        .failure_injector(Some(FailureInjector::at_index(4, FailureKind::Validation)))
        .build();

    let run = runner.run("alpha").await?;

    assert_eq!(run.records_processed, 9);
    assert_eq!(run.records_failed, 1);
    assert!(runner.records().get("alpha", "rec-4").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_configured_fail_at_record_counts_from_one() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let injection = FailureInjectionConfig {
        enabled: true,
        probability: 0.0,
        fail_at_record: Some(1),
        kind: FailureKind::Validation,
    };
    let runner = runner_builder(&pool)
        .source(Arc::new(StubAdapter::new("alpha", coins(0..3))), None)
        .failure_injector(injection.injector())
        .build();

    let run = runner.run("alpha").await?;

    assert_eq!(run.records_processed, 2);
    assert_eq!(run.records_failed, 1);
    assert!(runner.records().get("alpha", "rec-0").await?.is_none());
    assert!(runner.records().get("alpha", "rec-1").await?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_injected_storage_failure_aborts_run() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let runner = runner_builder(&pool)
        .source(Arc::new(StubAdapter::new("alpha", coins(0..10))), None)
        .failure_injector(Some(FailureInjector::new(1.0, None, FailureKind::Storage)))
        .build();

    let err = runner.run("alpha").await.unwrap_err();

    assert!(matches!(err, EtlError::Persistence(_)), "got {err:?}");
    assert_eq!(runner.records().count(None).await?, 0);
    let checkpoint = runner.get_checkpoint("alpha").await?;
    assert_eq!(checkpoint.status, CheckpointStatus::Failed);
    assert!(checkpoint.cursor.is_none());
    Ok(())
}

#[tokio::test]
async fn test_disabled_injector_never_fails() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let runner = runner_builder(&pool)
        .source(Arc::new(StubAdapter::new("alpha", coins(0..10))), None)
        .failure_injector(Some(FailureInjector::disabled()))
        .build();

    assert_eq!(runner.run("alpha").await?.records_processed, 10);
    Ok(())
}

#[tokio::test]
async fn test_run_refused_while_another_is_in_flight() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let runner = runner_with(&pool, vec![Arc::new(StubAdapter::new("alpha", coins(0..3)))]);

    let held = runner.checkpoints().begin_run("alpha").await?;
    let err = runner.run("alpha").await.unwrap_err();
    assert!(matches!(err, EtlError::RunInProgress(ref s) if s == "alpha"));

    // the holder is unaffected and can still commit
    runner.checkpoints().commit_success(&held, None, 0, 0).await?;
    assert_eq!(runner.run("alpha").await?.records_processed, 3);
    Ok(())
}

#[tokio::test]
async fn test_stale_run_is_taken_over() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let runner = runner_builder(&pool)
        .source(Arc::new(StubAdapter::new("alpha", coins(0..3))), None)
        .stale_after(Duration::ZERO)
        .build();

    let abandoned = runner.checkpoints().begin_run("alpha").await?;
    let run = runner.run("alpha").await?;
    assert_eq!(run.status, RunStatus::Success);

    let old = runner.checkpoints().get_run(abandoned.run_id).await?.unwrap();
    assert_eq!(old.status, RunStatus::Failed);

    // the displaced run can no longer commit
    let err = runner
        .checkpoints()
        .commit_success(&abandoned, Some("999"), 0, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, EtlError::StaleRun { .. }));
    assert_eq!(runner.get_checkpoint("alpha").await?.cursor.as_deref(), Some("3"));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_sources_run_independently() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let runner = runner_with(
        &pool,
        vec![
            Arc::new(StubAdapter::new("alpha", coins(0..5))),
            Arc::new(StubAdapter::new("beta", coins(0..7))),
        ],
    );

    let (a, b) = tokio::join!(runner.run("alpha"), runner.run("beta"));

    assert_eq!(a?.records_processed, 5);
    assert_eq!(b?.records_processed, 7);
    let counts = runner.record_counts().await?;
    assert_eq!(counts, vec![("alpha".to_string(), 5), ("beta".to_string(), 7)]);
    Ok(())
}

#[tokio::test]
async fn test_cancel_during_fetch_releases_checkpoint() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let adapter = StubAdapter::new("alpha", coins(0..3)).fetch_delay(Duration::from_secs(30));
    let runner = Arc::new(runner_with(&pool, vec![Arc::new(adapter)]));

    let cancel = CancellationToken::new();
    let task = {
        let runner = Arc::clone(&runner);
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.run_with_cancellation("alpha", cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    let err = task.await?.unwrap_err();
    assert!(matches!(err, EtlError::Cancelled(_)), "got {err:?}");

    let checkpoint = runner.get_checkpoint("alpha").await?;
    assert_eq!(checkpoint.status, CheckpointStatus::Idle);
    assert!(checkpoint.current_run_id.is_none());
    assert!(checkpoint.cursor.is_none());

    let runs = runner.list_runs(Some("alpha"), 1).await?;
    assert_eq!(runs[0].status, RunStatus::Cancelled);
    assert_eq!(runner.records().count(None).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_drift_observation_recorded_per_run() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let mut renamed = coin(0, "ETH");
    let price = renamed.remove("price").unwrap();
    renamed.insert("prices".to_string(), price);
    let runner = runner_with(&pool, vec![Arc::new(StubAdapter::new("alpha", vec![renamed]))]);

    // the renamed record fails normalization but the run itself succeeds
    let run = runner.run("alpha").await?;
    assert_eq!(run.records_failed, 1);

    let observations = runner.get_drift_observations(Some("alpha"), 10).await?;
    assert_eq!(observations.len(), 1);
    let obs = &observations[0];
    assert_eq!(obs.run_id, run.run_id);
    assert_eq!(obs.sample_count, 1);
    assert_eq!(obs.fuzzy_renames.get("prices").map(String::as_str), Some("price"));
    assert!(obs.missing_fields.is_empty());
    assert!(obs.extra_fields.is_empty());
    assert!((obs.confidence_score - 1.0).abs() < f64::EPSILON);
    Ok(())
}

#[tokio::test]
async fn test_drift_persistence_failure_does_not_block_ingestion() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let runner = runner_with(&pool, vec![Arc::new(StubAdapter::new("alpha", coins(0..5)))]);

    sqlx::query(
        r#"
        CREATE TRIGGER reject_drift BEFORE INSERT ON drift_observations
        BEGIN SELECT RAISE(ABORT, 'drift table unavailable'); END
        "#,
    )
    .execute(&pool)
    .await?;

    let run = runner.run("alpha").await?;

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.records_processed, 5);
    assert_eq!(runner.records().count(Some("alpha")).await?, 5);
    let checkpoint = runner.get_checkpoint("alpha").await?;
    assert_eq!(checkpoint.status, CheckpointStatus::Success);
    assert_eq!(checkpoint.cursor.as_deref(), Some("5"));
    assert!(runner.get_drift_observations(Some("alpha"), 10).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unknown_source_is_rejected() -> Result<()> {
    let pool = test_pool().await;
    let runner = runner_with(&pool, vec![]);

    let err = runner.run("nope").await.unwrap_err();
    assert!(matches!(err, EtlError::UnknownSource(ref s) if s == "nope"));
    assert!(runner.list_checkpoints().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_records_by_symbol() -> Result<()> {
    let pool = test_pool().await;
    let runner = runner_with(
        &pool,
        vec![
            Arc::new(StubAdapter::new("alpha", vec![coin(1, "BTC"), coin(2, "ETH")])),
            Arc::new(StubAdapter::new("beta", vec![coin(1, "BTC")])),
        ],
    );
    runner.run("alpha").await?;
    runner.run("beta").await?;

    let btc = runner.records_by_symbol("btc", 10).await?;
    assert_eq!(btc.len(), 2);
    assert!(btc.iter().all(|r| r.record.symbol == "BTC"));
    Ok(())
}

#[tokio::test]
async fn test_run_all_reports_each_source() -> Result<()> {
    init_tracing();
    let pool = test_pool().await;
    let runner = runner_with(
        &pool,
        vec![
            Arc::new(StubAdapter::new("alpha", coins(0..2))),
            Arc::new(StubAdapter::new("beta", coins(0..1)).failing_first(u32::MAX)),
        ],
    );

    let results = runner.run_all(CancellationToken::new()).await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "alpha");
    assert_eq!(results[0].1.as_ref().unwrap().records_processed, 2);
    assert_eq!(results[1].0, "beta");
    assert!(results[1].1.as_ref().unwrap_err().is_transient());
    Ok(())
}
