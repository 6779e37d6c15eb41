//! In-process store: an anomaly arena plus an index of open breach keys,
//! all behind one lock so check-and-insert is atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{AutomaticInsert, MonitoringStore, StoreError};
use crate::models::{
    Anomaly, AnomalyId, AnomalyStatus, BreachKey, DeterministicLimit, InstrumentId,
    InstrumentSnapshot, Reading, ReadingId, StatisticalLimit,
};

// ---

#[derive(Debug, Default)]
struct State {
    instruments: HashMap<InstrumentId, InstrumentSnapshot>,
    readings: HashMap<ReadingId, Reading>,
    anomalies: Vec<Anomaly>,
    by_id: HashMap<AnomalyId, usize>,
    open_breaches: HashMap<BreachKey, usize>,
}

impl State {
    fn push_anomaly(&mut self, anomaly: &Anomaly) -> Result<usize, StoreError> {
        // ---
        if self.by_id.contains_key(&anomaly.id) {
            return Err(StoreError::Duplicate {
                what: "anomaly",
                id: anomaly.id,
            });
        }
        let idx = self.anomalies.len();
        self.anomalies.push(anomaly.clone());
        self.by_id.insert(anomaly.id, idx);
        Ok(idx)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an instrument definition and its limits.
    pub async fn put_instrument(&self, snapshot: InstrumentSnapshot) {
        let mut state = self.state.lock().await;
        state.instruments.insert(snapshot.instrument.id, snapshot);
    }

    /// Replace the deterministic limit of an instrument. Returns `false` if
    /// the instrument is unknown.
    pub async fn set_deterministic_limit(
        &self,
        instrument_id: InstrumentId,
        limit: Option<DeterministicLimit>,
    ) -> bool {
        // ---
        let mut state = self.state.lock().await;
        match state.instruments.get_mut(&instrument_id) {
            Some(snapshot) => {
                snapshot.deterministic_limit = limit;
                true
            }
            None => false,
        }
    }

    /// Replace the statistical limits of an instrument. Returns `false` if
    /// the instrument is unknown.
    pub async fn set_statistical_limits(
        &self,
        instrument_id: InstrumentId,
        limits: Vec<StatisticalLimit>,
    ) -> bool {
        // ---
        let mut state = self.state.lock().await;
        match state.instruments.get_mut(&instrument_id) {
            Some(snapshot) => {
                snapshot.statistical_limits = limits;
                true
            }
            None => false,
        }
    }

    /// All anomalies in insertion order.
    pub async fn anomalies(&self) -> Vec<Anomaly> {
        self.state.lock().await.anomalies.clone()
    }
}

#[async_trait]
impl MonitoringStore for MemoryStore {
    async fn instrument_snapshot(
        &self,
        id: InstrumentId,
    ) -> Result<Option<InstrumentSnapshot>, StoreError> {
        Ok(self.state.lock().await.instruments.get(&id).cloned())
    }

    async fn insert_reading(&self, reading: &Reading) -> Result<(), StoreError> {
        // ---
        let mut state = self.state.lock().await;
        if state.readings.contains_key(&reading.id) {
            return Err(StoreError::Duplicate {
                what: "reading",
                id: reading.id,
            });
        }
        state.readings.insert(reading.id, reading.clone());
        Ok(())
    }

    async fn reading(&self, id: ReadingId) -> Result<Option<Reading>, StoreError> {
        Ok(self.state.lock().await.readings.get(&id).cloned())
    }

    async fn insert_automatic_anomaly(
        &self,
        anomaly: &Anomaly,
    ) -> Result<AutomaticInsert, StoreError> {
        // ---
        let Some(key) = anomaly.breach_key() else {
            return Err(StoreError::Corrupt(format!(
                "anomaly {} has no breach key",
                anomaly.id
            )));
        };

        let mut state = self.state.lock().await;
        if let Some(&idx) = state.open_breaches.get(&key) {
            return Ok(AutomaticInsert::AlreadyOpen {
                existing: Some(state.anomalies[idx].id),
            });
        }

        let idx = state.push_anomaly(anomaly)?;
        if anomaly.status.is_open() {
            state.open_breaches.insert(key, idx);
        }
        Ok(AutomaticInsert::Inserted)
    }

    async fn insert_anomaly(&self, anomaly: &Anomaly) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.push_anomaly(anomaly).map(|_| ())
    }

    async fn anomaly(&self, id: AnomalyId) -> Result<Option<Anomaly>, StoreError> {
        // ---
        let state = self.state.lock().await;
        Ok(state.by_id.get(&id).map(|&idx| state.anomalies[idx].clone()))
    }

    async fn update_anomaly_status(
        &self,
        id: AnomalyId,
        expected: AnomalyStatus,
        next: AnomalyStatus,
    ) -> Result<bool, StoreError> {
        // ---
        let mut state = self.state.lock().await;
        let Some(&idx) = state.by_id.get(&id) else {
            return Ok(false);
        };
        if state.anomalies[idx].status != expected {
            return Ok(false);
        }

        state.anomalies[idx].status = next;
        if !next.is_open() {
            if let Some(key) = state.anomalies[idx].breach_key() {
                if state.open_breaches.get(&key) == Some(&idx) {
                    state.open_breaches.remove(&key);
                }
            }
        }
        Ok(true)
    }
}
