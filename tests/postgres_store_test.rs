//! Live PostgreSQL checks for `PgStore`.
//!
//! Ignored by default. Run against a scratch database with:
//! `DATABASE_URL=postgres://... cargo test --test postgres_store_test -- --ignored`

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use damwatch::engine::anomaly::{self, AnomalyDecision};
use damwatch::models::AnomalyStatus;
use damwatch::{schema, EngineConfig, MonitoringStore, PgStore, ReadingPipeline, SubmitReading};

// ---

async fn connect() -> Result<PgPool> {
    // ---
    let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPoolOptions::new().max_connections(4).connect(&url).await?;
    schema::create_schema(&pool).await?;
    Ok(pool)
}

/// Insert "Piezometer-1" (`Level = P * K`, `K = 1.5`, deterministic `[0, 12]`)
/// under fresh ids and return the instrument id.
async fn seed_piezometer(pool: &PgPool) -> Result<Uuid> {
    // ---
    let id = Uuid::new_v4();

    sqlx::query("INSERT INTO instruments (id, dam_id, name, kind) VALUES ($1, $2, $3, $4)")
        .bind(id)
        .bind(Uuid::new_v4())
        .bind("Piezometer-1")
        .bind("piezometer")
        .execute(pool)
        .await?;

    sqlx::query(
        "INSERT INTO instrument_inputs (id, instrument_id, name, acronym) VALUES ($1, $2, $3, $4)",
    )
    .bind(Uuid::new_v4())
    .bind(id)
    .bind("pressure")
    .bind("P")
    .execute(pool)
    .await?;

    sqlx::query(
        "INSERT INTO instrument_constants (id, instrument_id, name, acronym, value) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(Uuid::new_v4())
    .bind(id)
    .bind("calibration")
    .bind("K")
    .bind(1.5_f64)
    .execute(pool)
    .await?;

    sqlx::query(
        "INSERT INTO instrument_outputs (id, instrument_id, name, acronym, formula) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(Uuid::new_v4())
    .bind(id)
    .bind("water level")
    .bind("Level")
    .bind("P * K")
    .execute(pool)
    .await?;

    sqlx::query(
        "INSERT INTO deterministic_limits (id, instrument_id, lower_bound, upper_bound) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(Uuid::new_v4())
    .bind(id)
    .bind(0.0_f64)
    .bind(12.0_f64)
    .execute(pool)
    .await?;

    Ok(id)
}

fn breaching_submission(instrument_id: Uuid) -> SubmitReading {
    SubmitReading {
        instrument_id,
        timestamp: Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap(),
        values: BTreeMap::from([("P".to_string(), 10.0)]),
    }
}

async fn open_automatic_count(pool: &PgPool, instrument_id: Uuid) -> Result<i64> {
    Ok(sqlx::query_scalar(
        "SELECT COUNT(*) FROM anomalies \
         WHERE instrument_id = $1 AND origin = 'AUTOMATIC' AND status IN ('OPEN', 'IN_PROGRESS')",
    )
    .bind(instrument_id)
    .fetch_one(pool)
    .await?)
}

#[tokio::test]
#[ignore = "needs DATABASE_URL pointing at a scratch PostgreSQL database"]
async fn snapshot_reads_seeded_definition() -> Result<()> {
    // ---
    let pool = connect().await?;
    let instrument_id = seed_piezometer(&pool).await?;
    let store = PgStore::new(pool);

    let snapshot = store
        .instrument_snapshot(instrument_id)
        .await?
        .context("seeded instrument must be found")?;
    assert_eq!(snapshot.instrument.outputs[0].formula, "P * K");
    assert_eq!(snapshot.instrument.constants[0].value, 1.5);
    let limit = snapshot.deterministic_limit.context("limit must be read")?;
    assert_eq!((limit.lower, limit.upper), (Some(0.0), Some(12.0)));

    assert!(store.instrument_snapshot(Uuid::new_v4()).await?.is_none());
    Ok(())
}

#[tokio::test]
#[ignore = "needs DATABASE_URL pointing at a scratch PostgreSQL database"]
async fn open_breach_index_dedups_and_releases_on_resolve() -> Result<()> {
    // ---
    let pool = connect().await?;
    let instrument_id = seed_piezometer(&pool).await?;
    let store = Arc::new(PgStore::new(pool.clone()));
    let pipeline = ReadingPipeline::new(store.clone(), EngineConfig::default());

    let first = pipeline.submit_reading(breaching_submission(instrument_id)).await?;
    let AnomalyDecision::Created(created) = &first.anomalies[0] else {
        panic!("first breach must open an anomaly");
    };
    assert_eq!(created.observed_value, Some(15.0));

    // Conflicting insert hits the partial unique index and is skipped.
    let second = pipeline.submit_reading(breaching_submission(instrument_id)).await?;
    match &second.anomalies[0] {
        AnomalyDecision::Skipped { existing, .. } => {
            assert_eq!(*existing, Some(created.anomaly_id))
        }
        other => panic!("expected a skipped decision, got {other:?}"),
    }
    assert_eq!(open_automatic_count(&pool, instrument_id).await?, 1);

    // IN_PROGRESS still holds the key.
    anomaly::transition(store.as_ref(), created.anomaly_id, AnomalyStatus::InProgress).await?;
    let third = pipeline.submit_reading(breaching_submission(instrument_id)).await?;
    assert!(matches!(third.anomalies[0], AnomalyDecision::Skipped { .. }));

    // RESOLVED releases it.
    let resolved =
        anomaly::transition(store.as_ref(), created.anomaly_id, AnomalyStatus::Resolved).await?;
    assert_eq!(resolved.status, AnomalyStatus::Resolved);

    let fourth = pipeline.submit_reading(breaching_submission(instrument_id)).await?;
    let AnomalyDecision::Created(reopened) = &fourth.anomalies[0] else {
        panic!("a resolved breach must not block a new anomaly");
    };
    assert_ne!(reopened.anomaly_id, created.anomaly_id);
    assert_eq!(open_automatic_count(&pool, instrument_id).await?, 1);

    Ok(())
}

#[tokio::test]
#[ignore = "needs DATABASE_URL pointing at a scratch PostgreSQL database"]
async fn concurrent_breaches_open_one_anomaly() -> Result<()> {
    // ---
    let pool = connect().await?;
    let instrument_id = seed_piezometer(&pool).await?;
    let pipeline = Arc::new(ReadingPipeline::new(
        Arc::new(PgStore::new(pool.clone())),
        EngineConfig::default(),
    ));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pipeline = pipeline.clone();
        handles.push(tokio::spawn(async move {
            pipeline.submit_reading(breaching_submission(instrument_id)).await
        }));
    }

    let mut created = 0;
    for handle in handles {
        let outcome = handle.await??;
        if matches!(outcome.anomalies[0], AnomalyDecision::Created(_)) {
            created += 1;
        }
    }

    assert_eq!(created, 1);
    assert_eq!(open_automatic_count(&pool, instrument_id).await?, 1);
    Ok(())
}
