//! PostgreSQL store.
//!
//! The open-breach invariant is the partial unique index
//! `uq_anomalies_open_breach` created by [`crate::schema::create_schema`];
//! automatic anomalies are inserted with `ON CONFLICT DO NOTHING`, so the
//! losing writer of a race simply gets no row back.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use super::{AutomaticInsert, MonitoringStore, StoreError};
use crate::models::{
    Anomaly, AnomalyId, AnomalyStatus, Constant, DeterministicLimit, Input, Instrument,
    InstrumentId, InstrumentSnapshot, Output, Reading, ReadingId, StatisticalLimit,
};

// ---

const INSERT_ANOMALY: &str = r#"
    INSERT INTO anomalies (
        id, instrument_id, dam_id, reading_id, origin,
        breach_kind, breach_output, observation, observed_value,
        danger_level_id, status, created_at
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
"#;

#[derive(Debug, sqlx::FromRow)]
struct InstrumentRow {
    id: Uuid,
    dam_id: Uuid,
    name: String,
    kind: String,
    primary_output: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct InputRow {
    id: Uuid,
    name: String,
    acronym: String,
}

#[derive(Debug, sqlx::FromRow)]
struct ConstantRow {
    id: Uuid,
    name: String,
    acronym: String,
    value: f64,
}

#[derive(Debug, sqlx::FromRow)]
struct OutputRow {
    id: Uuid,
    name: String,
    acronym: String,
    formula: String,
}

#[derive(Debug, sqlx::FromRow)]
struct LimitRow {
    id: Uuid,
    owner_id: Uuid,
    lower_bound: Option<f64>,
    upper_bound: Option<f64>,
}

#[derive(Debug, sqlx::FromRow)]
struct ReadingRow {
    id: Uuid,
    instrument_id: Uuid,
    timestamp_utc: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct ReadingValueRow {
    acronym: String,
    value: f64,
}

#[derive(Debug, sqlx::FromRow)]
struct AnomalyRow {
    id: Uuid,
    instrument_id: Uuid,
    dam_id: Uuid,
    reading_id: Option<Uuid>,
    origin: String,
    breach_kind: Option<String>,
    breach_output: Option<String>,
    observation: String,
    observed_value: Option<f64>,
    danger_level_id: i32,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<AnomalyRow> for Anomaly {
    type Error = StoreError;

    fn try_from(row: AnomalyRow) -> Result<Self, Self::Error> {
        // ---
        Ok(Anomaly {
            id: row.id,
            instrument_id: row.instrument_id,
            dam_id: row.dam_id,
            reading_id: row.reading_id,
            origin: row.origin.parse().map_err(StoreError::Corrupt)?,
            breach_kind: row
                .breach_kind
                .map(|k| k.parse())
                .transpose()
                .map_err(StoreError::Corrupt)?,
            breach_output: row.breach_output,
            observation: row.observation,
            observed_value: row.observed_value,
            danger_level_id: row.danger_level_id,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            created_at: row.created_at,
        })
    }
}

fn bind_anomaly<'q>(
    query: Query<'q, Postgres, PgArguments>,
    a: &'q Anomaly,
) -> Query<'q, Postgres, PgArguments> {
    // ---
    query
        .bind(a.id)
        .bind(a.instrument_id)
        .bind(a.dam_id)
        .bind(a.reading_id)
        .bind(a.origin.as_str())
        .bind(a.breach_kind.map(|k| k.as_str()))
        .bind(a.breach_output.as_deref())
        .bind(&a.observation)
        .bind(a.observed_value)
        .bind(a.danger_level_id)
        .bind(a.status.as_str())
        .bind(a.created_at)
}

// ---

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MonitoringStore for PgStore {
    async fn instrument_snapshot(
        &self,
        id: InstrumentId,
    ) -> Result<Option<InstrumentSnapshot>, StoreError> {
        // ---
        // One read-only snapshot so definition and limits agree.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let Some(row) = sqlx::query_as::<_, InstrumentRow>(
            "SELECT id, dam_id, name, kind, primary_output FROM instruments WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            tx.commit().await?;
            return Ok(None);
        };

        let inputs = sqlx::query_as::<_, InputRow>(
            "SELECT id, name, acronym FROM instrument_inputs \
             WHERE instrument_id = $1 ORDER BY acronym",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        let constants = sqlx::query_as::<_, ConstantRow>(
            "SELECT id, name, acronym, value FROM instrument_constants \
             WHERE instrument_id = $1 ORDER BY acronym",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        let outputs = sqlx::query_as::<_, OutputRow>(
            "SELECT id, name, acronym, formula FROM instrument_outputs \
             WHERE instrument_id = $1 ORDER BY position, acronym",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        let deterministic = sqlx::query_as::<_, LimitRow>(
            r#"
            SELECT id, instrument_id AS owner_id, lower_bound, upper_bound
            FROM deterministic_limits
            WHERE instrument_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let statistical = sqlx::query_as::<_, LimitRow>(
            r#"
            SELECT s.id, s.output_id AS owner_id, s.lower_bound, s.upper_bound
            FROM statistical_limits s
            JOIN instrument_outputs o ON o.id = s.output_id
            WHERE o.instrument_id = $1
            "#,
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let instrument = Instrument {
            id: row.id,
            dam_id: row.dam_id,
            name: row.name,
            kind: row.kind,
            inputs: inputs
                .into_iter()
                .map(|r| Input {
                    id: r.id,
                    name: r.name,
                    acronym: r.acronym,
                })
                .collect(),
            constants: constants
                .into_iter()
                .map(|r| Constant {
                    id: r.id,
                    name: r.name,
                    acronym: r.acronym,
                    value: r.value,
                })
                .collect(),
            outputs: outputs
                .into_iter()
                .map(|r| Output {
                    id: r.id,
                    name: r.name,
                    acronym: r.acronym,
                    formula: r.formula,
                })
                .collect(),
            primary_output: row.primary_output,
        };

        Ok(Some(InstrumentSnapshot {
            instrument,
            deterministic_limit: deterministic.map(|r| DeterministicLimit {
                id: r.id,
                instrument_id: r.owner_id,
                lower: r.lower_bound,
                upper: r.upper_bound,
            }),
            statistical_limits: statistical
                .into_iter()
                .map(|r| StatisticalLimit {
                    id: r.id,
                    output_id: r.owner_id,
                    lower: r.lower_bound,
                    upper: r.upper_bound,
                })
                .collect(),
        }))
    }

    async fn insert_reading(&self, reading: &Reading) -> Result<(), StoreError> {
        // ---
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO readings (id, instrument_id, timestamp_utc)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(reading.id)
        .bind(reading.instrument_id)
        .bind(reading.timestamp)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::Duplicate {
                what: "reading",
                id: reading.id,
            });
        }

        for (acronym, value) in &reading.values {
            sqlx::query(
                "INSERT INTO reading_values (reading_id, acronym, value) VALUES ($1, $2, $3)",
            )
            .bind(reading.id)
            .bind(acronym)
            .bind(*value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn reading(&self, id: ReadingId) -> Result<Option<Reading>, StoreError> {
        // ---
        let Some(row) = sqlx::query_as::<_, ReadingRow>(
            "SELECT id, instrument_id, timestamp_utc FROM readings WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let values: BTreeMap<String, f64> = sqlx::query_as::<_, ReadingValueRow>(
            "SELECT acronym, value FROM reading_values WHERE reading_id = $1",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| (r.acronym, r.value))
        .collect();

        Ok(Some(Reading {
            id: row.id,
            instrument_id: row.instrument_id,
            timestamp: row.timestamp_utc,
            values,
        }))
    }

    async fn insert_automatic_anomaly(
        &self,
        anomaly: &Anomaly,
    ) -> Result<AutomaticInsert, StoreError> {
        // ---
        let sql = format!("{INSERT_ANOMALY} ON CONFLICT DO NOTHING RETURNING id");
        let inserted = bind_anomaly(sqlx::query(&sql), anomaly)
            .fetch_optional(&self.pool)
            .await?;

        if inserted.is_some() {
            return Ok(AutomaticInsert::Inserted);
        }

        let existing: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM anomalies
            WHERE instrument_id = $1
              AND breach_kind = $2
              AND breach_output = $3
              AND origin = 'AUTOMATIC'
              AND status IN ('OPEN', 'IN_PROGRESS')
            "#,
        )
        .bind(anomaly.instrument_id)
        .bind(anomaly.breach_kind.map(|k| k.as_str()))
        .bind(anomaly.breach_output.as_deref())
        .fetch_optional(&self.pool)
        .await?;

        Ok(AutomaticInsert::AlreadyOpen { existing })
    }

    async fn insert_anomaly(&self, anomaly: &Anomaly) -> Result<(), StoreError> {
        bind_anomaly(sqlx::query(INSERT_ANOMALY), anomaly)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn anomaly(&self, id: AnomalyId) -> Result<Option<Anomaly>, StoreError> {
        // ---
        sqlx::query_as::<_, AnomalyRow>(
            r#"
            SELECT id, instrument_id, dam_id, reading_id, origin,
                   breach_kind, breach_output, observation, observed_value,
                   danger_level_id, status, created_at
            FROM anomalies
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(Anomaly::try_from)
        .transpose()
    }

    async fn update_anomaly_status(
        &self,
        id: AnomalyId,
        expected: AnomalyStatus,
        next: AnomalyStatus,
    ) -> Result<bool, StoreError> {
        // ---
        let result = sqlx::query("UPDATE anomalies SET status = $3 WHERE id = $1 AND status = $2")
            .bind(id)
            .bind(expected.as_str())
            .bind(next.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
