//! Turns breach verdicts into automatic anomalies, and handles the manual
//! entry point and status workflow that share the same storage shape.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::limits::Verdict;
use crate::models::{
    Anomaly, AnomalyCreated, AnomalyId, AnomalyOrigin, AnomalyStatus, BreachKey, DangerLevel,
    DangerLevelId, Instrument, InstrumentId, Reading, ReadingId, ViolatedBound,
};
use crate::store::{AutomaticInsert, MonitoringStore, StoreError};

// ---

#[derive(Debug, Error)]
pub enum AnomalyError {
    #[error("instrument {0} not found")]
    UnknownInstrument(InstrumentId),

    #[error("anomaly {0} not found")]
    NotFound(AnomalyId),

    #[error("no danger level with id {0}")]
    UnknownDangerLevel(DangerLevelId),

    #[error("cannot move anomaly from {from:?} to {to:?}")]
    InvalidTransition {
        from: AnomalyStatus,
        to: AnomalyStatus,
    },

    #[error("anomaly {0} was modified concurrently")]
    Conflict(AnomalyId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What happened to one breach verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AnomalyDecision {
    Created(AnomalyCreated),
    /// An open automatic anomaly already covers this breach.
    Skipped {
        key: BreachKey,
        existing: Option<AnomalyId>,
    },
}

/// Human-readable description of a breach verdict.
pub fn observation(instrument: &Instrument, verdict: &Verdict) -> String {
    // ---
    let kind = match verdict.kind.breach() {
        Some(k) => k.as_str().to_lowercase(),
        None => return format!("{} = {} is within limits", verdict.output, verdict.observed),
    };
    let side = match verdict.bound {
        Some(ViolatedBound::Lower(v)) => format!("below lower bound {v}"),
        Some(ViolatedBound::Upper(v)) => format!("above upper bound {v}"),
        None => "outside limit".to_string(),
    };
    let limit = verdict
        .limit
        .map(|l| format!(" {l}"))
        .unwrap_or_default();
    format!(
        "{}: output {} = {} is {} of {} limit{}",
        instrument.name, verdict.output, verdict.observed, side, kind, limit
    )
}

/// Create one automatic anomaly per breaching verdict, skipping breaches
/// that already have an open automatic anomaly.
///
/// `NORMAL` verdicts are ignored. The dedup check happens inside the store
/// as one atomic step, so concurrent readings of the same ongoing breach
/// still produce a single open anomaly; the losers come back as `Skipped`.
pub async fn generate(
    store: &dyn MonitoringStore,
    instrument: &Instrument,
    reading: &Reading,
    verdicts: &[Verdict],
) -> Result<Vec<AnomalyDecision>, StoreError> {
    // ---
    let mut decisions = Vec::new();

    for verdict in verdicts {
        let (Some(kind), Some(danger_level_id)) = (verdict.kind.breach(), verdict.danger_level_id)
        else {
            continue;
        };

        let anomaly = Anomaly {
            id: Uuid::new_v4(),
            instrument_id: instrument.id,
            dam_id: instrument.dam_id,
            reading_id: Some(reading.id),
            origin: AnomalyOrigin::Automatic,
            breach_kind: Some(kind),
            breach_output: Some(verdict.output.clone()),
            observation: observation(instrument, verdict),
            observed_value: Some(verdict.observed),
            danger_level_id,
            status: AnomalyStatus::Open,
            created_at: Utc::now(),
        };

        match store.insert_automatic_anomaly(&anomaly).await? {
            AutomaticInsert::Inserted => {
                info!(
                    "Anomaly {} opened: {} (danger level {})",
                    anomaly.id, anomaly.observation, danger_level_id
                );
                decisions.push(AnomalyDecision::Created(AnomalyCreated::from(&anomaly)));
            }
            AutomaticInsert::AlreadyOpen { existing } => {
                debug!(
                    "Skipping {} breach on {}/{}: anomaly {:?} still open",
                    kind.as_str(),
                    instrument.id,
                    verdict.output,
                    existing
                );
                decisions.push(AnomalyDecision::Skipped {
                    key: BreachKey {
                        instrument_id: instrument.id,
                        kind,
                        output: verdict.output.clone(),
                    },
                    existing,
                });
            }
        }
    }

    Ok(decisions)
}

/// A user-reported anomaly.
#[derive(Debug, Clone, Deserialize)]
pub struct ManualAnomaly {
    pub instrument_id: InstrumentId,
    #[serde(default)]
    pub reading_id: Option<ReadingId>,
    pub observation: String,
    pub danger_level_id: DangerLevelId,
}

/// Record a manual anomaly. Never deduplicated.
pub async fn create_manual(
    store: &dyn MonitoringStore,
    request: ManualAnomaly,
) -> Result<Anomaly, AnomalyError> {
    // ---
    if DangerLevel::by_id(request.danger_level_id).is_none() {
        return Err(AnomalyError::UnknownDangerLevel(request.danger_level_id));
    }
    let snapshot = store
        .instrument_snapshot(request.instrument_id)
        .await?
        .ok_or(AnomalyError::UnknownInstrument(request.instrument_id))?;

    let anomaly = Anomaly {
        id: Uuid::new_v4(),
        instrument_id: snapshot.instrument.id,
        dam_id: snapshot.instrument.dam_id,
        reading_id: request.reading_id,
        origin: AnomalyOrigin::Manual,
        breach_kind: None,
        breach_output: None,
        observation: request.observation,
        observed_value: None,
        danger_level_id: request.danger_level_id,
        status: AnomalyStatus::Open,
        created_at: Utc::now(),
    };
    store.insert_anomaly(&anomaly).await?;

    info!("Manual anomaly {} recorded", anomaly.id);
    Ok(anomaly)
}

/// Move an anomaly along the status workflow.
pub async fn transition(
    store: &dyn MonitoringStore,
    id: AnomalyId,
    next: AnomalyStatus,
) -> Result<Anomaly, AnomalyError> {
    // ---
    let mut anomaly = store.anomaly(id).await?.ok_or(AnomalyError::NotFound(id))?;

    if !anomaly.status.can_transition_to(next) {
        return Err(AnomalyError::InvalidTransition {
            from: anomaly.status,
            to: next,
        });
    }
    if !store.update_anomaly_status(id, anomaly.status, next).await? {
        return Err(AnomalyError::Conflict(id));
    }

    info!(
        "Anomaly {} moved {} -> {}",
        id,
        anomaly.status.as_str(),
        next.as_str()
    );
    anomaly.status = next;
    Ok(anomaly)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::limits::{classify, VerdictKind};
    use crate::models::Interval;
    use crate::store::MemoryStore;
    use crate::test_support::{deterministic, piezometer, reading, snapshot, values};

    fn breach_verdicts(instrument: &Instrument, level: f64) -> Vec<Verdict> {
        // ---
        let mut snap = snapshot(instrument.clone());
        snap.deterministic_limit = Some(deterministic(instrument, 0.0, 12.0));
        classify(&snap, &values(&[("Level", level)]), &EngineConfig::default())
    }

    #[test]
    fn test_breach_creates_open_automatic_anomaly() {
        // ---
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let instrument = piezometer();
            let r = reading(&instrument, &[("P", 10.0)]);

            let decisions = generate(&store, &instrument, &r, &breach_verdicts(&instrument, 15.0))
                .await
                .unwrap();

            assert_eq!(decisions.len(), 1);
            let AnomalyDecision::Created(event) = &decisions[0] else {
                panic!("expected a created anomaly, got {:?}", decisions[0]);
            };
            assert_eq!(event.origin, AnomalyOrigin::Automatic);
            assert_eq!(event.status, AnomalyStatus::Open);
            assert_eq!(event.status_id, 1);
            assert_eq!(event.reading_id, Some(r.id));
            assert_eq!(event.dam_id, instrument.dam_id);
            assert_eq!(event.observed_value, Some(15.0));
            assert_eq!(event.danger_level_id, 3);
        });
    }

    #[test]
    fn test_normal_verdicts_create_nothing() {
        // ---
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let instrument = piezometer();
            let r = reading(&instrument, &[("P", 2.0)]);
            let verdicts = breach_verdicts(&instrument, 3.0);
            assert_eq!(verdicts[0].kind, VerdictKind::Normal);

            let decisions = generate(&store, &instrument, &r, &verdicts).await.unwrap();
            assert!(decisions.is_empty());
            assert!(store.anomalies().await.is_empty());
        });
    }

    #[test]
    fn test_repeated_breach_is_skipped() {
        // ---
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let instrument = piezometer();
            let verdicts = breach_verdicts(&instrument, 15.0);

            let first = reading(&instrument, &[("P", 10.0)]);
            let second = reading(&instrument, &[("P", 10.0)]);
            generate(&store, &instrument, &first, &verdicts).await.unwrap();
            let decisions = generate(&store, &instrument, &second, &verdicts)
                .await
                .unwrap();

            assert!(matches!(
                &decisions[0],
                AnomalyDecision::Skipped { existing: Some(_), key } if key.output == "Level"
            ));
            assert_eq!(store.anomalies().await.len(), 1);
        });
    }

    #[test]
    fn test_manual_anomalies_bypass_dedup() {
        // ---
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let instrument = piezometer();
            store.put_instrument(snapshot(instrument.clone())).await;

            for _ in 0..2 {
                let anomaly = create_manual(
                    &store,
                    ManualAnomaly {
                        instrument_id: instrument.id,
                        reading_id: None,
                        observation: "seepage at the toe".to_string(),
                        danger_level_id: 2,
                    },
                )
                .await
                .unwrap();
                assert_eq!(anomaly.origin, AnomalyOrigin::Manual);
                assert_eq!(anomaly.dam_id, instrument.dam_id);
            }
            assert_eq!(store.anomalies().await.len(), 2);
        });
    }

    #[test]
    fn test_manual_anomaly_validates_references() {
        // ---
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let request = ManualAnomaly {
                instrument_id: Uuid::new_v4(),
                reading_id: None,
                observation: "x".to_string(),
                danger_level_id: 2,
            };
            assert!(matches!(
                create_manual(&store, request.clone()).await,
                Err(AnomalyError::UnknownInstrument(_))
            ));

            let bad_level = ManualAnomaly {
                danger_level_id: 99,
                ..request
            };
            assert!(matches!(
                create_manual(&store, bad_level).await,
                Err(AnomalyError::UnknownDangerLevel(99))
            ));
        });
    }

    #[test]
    fn test_transition_workflow() {
        // ---
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let instrument = piezometer();
            let r = reading(&instrument, &[("P", 10.0)]);
            let decisions = generate(&store, &instrument, &r, &breach_verdicts(&instrument, 15.0))
                .await
                .unwrap();
            let AnomalyDecision::Created(event) = &decisions[0] else {
                panic!("expected a created anomaly");
            };

            let a = transition(&store, event.anomaly_id, AnomalyStatus::InProgress)
                .await
                .unwrap();
            assert_eq!(a.status, AnomalyStatus::InProgress);
            assert_eq!(a.origin, AnomalyOrigin::Automatic);

            assert!(matches!(
                transition(&store, event.anomaly_id, AnomalyStatus::Open).await,
                Err(AnomalyError::InvalidTransition { .. })
            ));

            transition(&store, event.anomaly_id, AnomalyStatus::Resolved)
                .await
                .unwrap();

            // Resolved releases the key: the next breach opens a new anomaly.
            let again = generate(&store, &instrument, &r, &breach_verdicts(&instrument, 15.0))
                .await
                .unwrap();
            assert!(matches!(again[0], AnomalyDecision::Created(_)));
        });
    }

    #[test]
    fn test_observation_text() {
        // ---
        let instrument = piezometer();
        let verdict = Verdict {
            output: "Level".to_string(),
            kind: VerdictKind::DeterministicBreach,
            observed: 15.0,
            bound: Some(ViolatedBound::Upper(12.0)),
            limit: Some(Interval::closed(0.0, 12.0)),
            danger_level_id: Some(3),
        };
        assert_eq!(
            observation(&instrument, &verdict),
            "Piezometer-1: output Level = 15 is above upper bound 12 of deterministic limit [0, 12]"
        );
    }
}
