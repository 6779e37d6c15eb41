//! Storage boundary for the engine.
//!
//! Entity CRUD lives outside this crate; the engine only needs to read an
//! instrument snapshot, append readings and write anomalies. The one piece of
//! shared mutable state, "at most one open automatic anomaly per breach key",
//! is enforced here by every implementation as a single atomic operation.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{
    Anomaly, AnomalyId, AnomalyStatus, InstrumentId, InstrumentSnapshot, Reading, ReadingId,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{what} {id} already exists")]
    Duplicate { what: &'static str, id: uuid::Uuid },

    #[error("stored row is invalid: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Result of the atomic check-and-insert for automatic anomalies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomaticInsert {
    Inserted,
    /// An open automatic anomaly already holds the breach key. `existing`
    /// is its id when the store could tell.
    AlreadyOpen { existing: Option<AnomalyId> },
}

#[async_trait]
pub trait MonitoringStore: Send + Sync {
    /// Instrument definition plus its current limits, read together.
    async fn instrument_snapshot(
        &self,
        id: InstrumentId,
    ) -> Result<Option<InstrumentSnapshot>, StoreError>;

    /// Append a reading. Readings are never updated afterwards.
    async fn insert_reading(&self, reading: &Reading) -> Result<(), StoreError>;

    async fn reading(&self, id: ReadingId) -> Result<Option<Reading>, StoreError>;

    /// Insert `anomaly` unless an open automatic anomaly already holds its
    /// breach key. Check and insert happen as one atomic step.
    async fn insert_automatic_anomaly(&self, anomaly: &Anomaly)
        -> Result<AutomaticInsert, StoreError>;

    /// Insert without any dedup check (manual anomalies).
    async fn insert_anomaly(&self, anomaly: &Anomaly) -> Result<(), StoreError>;

    async fn anomaly(&self, id: AnomalyId) -> Result<Option<Anomaly>, StoreError>;

    /// Compare-and-set the status of an anomaly. Returns `false` when the
    /// anomaly is missing or its status is no longer `expected`. Moving an
    /// automatic anomaly out of an open status releases its breach key.
    async fn update_anomaly_status(
        &self,
        id: AnomalyId,
        expected: AnomalyStatus,
        next: AnomalyStatus,
    ) -> Result<bool, StoreError>;
}
