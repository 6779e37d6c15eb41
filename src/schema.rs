//! Database schema management for `codemetal-damwatch`.
//!
//! Ensures required tables, indexes and reference data exist before serving
//! requests. Applied once on startup from `main.rs` (EMBP: single gateway call).

use anyhow::Result;
use sqlx::PgPool;

use crate::models::{AnomalyStatus, DANGER_LEVELS};

// ---

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS instruments (
        id             UUID PRIMARY KEY,
        dam_id         UUID NOT NULL,
        name           TEXT NOT NULL,
        kind           TEXT NOT NULL,
        primary_output TEXT
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS instrument_inputs (
        id            UUID PRIMARY KEY,
        instrument_id UUID NOT NULL REFERENCES instruments (id),
        name          TEXT NOT NULL,
        acronym       TEXT NOT NULL,
        UNIQUE (instrument_id, acronym)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS instrument_constants (
        id            UUID PRIMARY KEY,
        instrument_id UUID NOT NULL REFERENCES instruments (id),
        name          TEXT NOT NULL,
        acronym       TEXT NOT NULL,
        value         DOUBLE PRECISION NOT NULL,
        UNIQUE (instrument_id, acronym)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS instrument_outputs (
        id            UUID PRIMARY KEY,
        instrument_id UUID NOT NULL REFERENCES instruments (id),
        name          TEXT NOT NULL,
        acronym       TEXT NOT NULL,
        formula       TEXT NOT NULL,
        position      INTEGER NOT NULL DEFAULT 0,
        UNIQUE (instrument_id, acronym)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS deterministic_limits (
        id            UUID PRIMARY KEY,
        instrument_id UUID NOT NULL UNIQUE REFERENCES instruments (id),
        lower_bound   DOUBLE PRECISION,
        upper_bound   DOUBLE PRECISION
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS statistical_limits (
        id          UUID PRIMARY KEY,
        output_id   UUID NOT NULL UNIQUE REFERENCES instrument_outputs (id),
        lower_bound DOUBLE PRECISION,
        upper_bound DOUBLE PRECISION
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS readings (
        id            UUID PRIMARY KEY,
        instrument_id UUID NOT NULL REFERENCES instruments (id),
        timestamp_utc TIMESTAMPTZ NOT NULL,
        received_at   TIMESTAMPTZ NOT NULL DEFAULT now()
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS reading_values (
        reading_id UUID NOT NULL REFERENCES readings (id),
        acronym    TEXT NOT NULL,
        value      DOUBLE PRECISION NOT NULL,
        PRIMARY KEY (reading_id, acronym)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS danger_levels (
        id   INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        rank SMALLINT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS anomaly_statuses (
        id   INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS anomalies (
        id              UUID PRIMARY KEY,
        instrument_id   UUID NOT NULL REFERENCES instruments (id),
        dam_id          UUID NOT NULL,
        reading_id      UUID REFERENCES readings (id),
        origin          TEXT NOT NULL CHECK (origin IN ('AUTOMATIC', 'MANUAL')),
        breach_kind     TEXT,
        breach_output   TEXT,
        observation     TEXT NOT NULL,
        observed_value  DOUBLE PRECISION,
        danger_level_id INTEGER NOT NULL REFERENCES danger_levels (id),
        status          TEXT NOT NULL REFERENCES anomaly_statuses (name),
        created_at      TIMESTAMPTZ NOT NULL
    );
    "#,
];

const INDEXES: &[&str] = &[
    // At most one open automatic anomaly per breach key.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_anomalies_open_breach
        ON anomalies (instrument_id, breach_kind, breach_output)
        WHERE origin = 'AUTOMATIC' AND status IN ('OPEN', 'IN_PROGRESS');
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_readings_instrument_id
        ON readings (instrument_id, timestamp_utc);
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_anomalies_instrument_id
        ON anomalies (instrument_id);
    "#,
];

/// Create or update the database schema (idempotent).
///
/// Creates the instrument definition, limit, reading and anomaly tables and
/// seeds the danger level and anomaly status reference data. Safe to call on
/// every startup; no-op if objects already exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    for statement in TABLES.iter().chain(INDEXES) {
        sqlx::query(statement).execute(&mut *tx).await?;
    }

    // Reference data
    for level in DANGER_LEVELS {
        sqlx::query(
            r#"
            INSERT INTO danger_levels (id, name, rank)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, rank = EXCLUDED.rank
            "#,
        )
        .bind(level.id)
        .bind(level.name)
        .bind(i16::from(level.rank))
        .execute(&mut *tx)
        .await?;
    }

    for status in [
        AnomalyStatus::Open,
        AnomalyStatus::InProgress,
        AnomalyStatus::Resolved,
        AnomalyStatus::Closed,
    ] {
        sqlx::query(
            "INSERT INTO anomaly_statuses (id, name) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
        )
        .bind(status.id())
        .bind(status.as_str())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}
