//! Reading pipeline: bind → resolve → classify → generate.
//!
//! This is what the service layer calls for every submitted reading. One
//! invocation reads the instrument snapshot once and runs the stages
//! sequentially; independent invocations share nothing but the store and
//! may run concurrently.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::EngineConfig;
use crate::engine::anomaly::{self, AnomalyDecision};
use crate::engine::binder::{bind, BindError};
use crate::engine::definition::{validate_instrument, DefinitionError};
use crate::engine::expr::{self, Formula, SyntaxError};
use crate::engine::limits::{classify, Verdict};
use crate::engine::resolver::{resolve, OutputError};
use crate::models::{Instrument, InstrumentId, InstrumentSnapshot, Reading, ReadingId};
use crate::store::{MonitoringStore, StoreError};

// ---

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("instrument {0} not found")]
    UnknownInstrument(InstrumentId),

    #[error("reading {0} not found")]
    UnknownReading(ReadingId),

    #[error("reading {reading_id} rejected: {source}")]
    Rejected {
        reading_id: ReadingId,
        #[source]
        source: BindError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Inbound request: one batch of input values for an instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReading {
    pub instrument_id: InstrumentId,
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
}

/// Computed outputs and verdicts for one reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingAssessment {
    pub reading_id: ReadingId,
    pub instrument_id: InstrumentId,
    pub outputs: BTreeMap<String, f64>,
    /// Outputs that could not be computed for this reading.
    pub output_errors: Vec<OutputError>,
    pub verdicts: Vec<Verdict>,
}

impl ReadingAssessment {
    pub fn breaches(&self) -> impl Iterator<Item = &Verdict> {
        self.verdicts.iter().filter(|v| v.is_breach())
    }
}

/// Result of a submitted reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingOutcome {
    #[serde(flatten)]
    pub assessment: ReadingAssessment,
    pub anomalies: Vec<AnomalyDecision>,
}

/// Bind, resolve and classify `reading` against `snapshot`. Pure: touches
/// no storage and never mutates the reading.
pub fn assess(
    snapshot: &InstrumentSnapshot,
    reading: &Reading,
    config: &EngineConfig,
) -> Result<ReadingAssessment, BindError> {
    // ---
    let context = bind(&snapshot.instrument, reading)?;
    let resolution = resolve(&snapshot.instrument, &context, config.allow_output_chaining);
    let verdicts = classify(snapshot, &resolution.values, config);

    Ok(ReadingAssessment {
        reading_id: reading.id,
        instrument_id: snapshot.instrument.id,
        outputs: resolution.values,
        output_errors: resolution.errors,
        verdicts,
    })
}

/// Authoring-time formula check against the names a formula may use.
pub fn validate_formula<S: AsRef<str>>(text: &str, known: &[S]) -> Result<Formula, SyntaxError> {
    expr::validate(text, known)
}

// ---

pub struct ReadingPipeline {
    store: Arc<dyn MonitoringStore>,
    config: EngineConfig,
}

impl ReadingPipeline {
    pub fn new(store: Arc<dyn MonitoringStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn MonitoringStore {
        self.store.as_ref()
    }

    /// Store a reading and run it through the whole pipeline.
    ///
    /// The reading is stored before binding so partial submissions stay on
    /// record; a reading that cannot be bound is then rejected with its id.
    #[instrument(skip(self, request), fields(instrument_id = %request.instrument_id))]
    pub async fn submit_reading(
        &self,
        request: SubmitReading,
    ) -> Result<ReadingOutcome, PipelineError> {
        // ---
        let snapshot = self
            .store
            .instrument_snapshot(request.instrument_id)
            .await?
            .ok_or(PipelineError::UnknownInstrument(request.instrument_id))?;

        let reading = Reading::new(request.instrument_id, request.timestamp, request.values);
        self.store.insert_reading(&reading).await?;

        let assessment = assess(&snapshot, &reading, &self.config).map_err(|source| {
            warn!("Reading {} rejected: {}", reading.id, source);
            PipelineError::Rejected {
                reading_id: reading.id,
                source,
            }
        })?;

        if !assessment.output_errors.is_empty() {
            warn!(
                "Reading {}: {} output(s) could not be computed",
                reading.id,
                assessment.output_errors.len()
            );
        }

        let anomalies = anomaly::generate(
            self.store.as_ref(),
            &snapshot.instrument,
            &reading,
            &assessment.verdicts,
        )
        .await?;

        info!(
            "Reading {} processed: {} output(s), {} verdict(s), {} breach(es), {} decision(s)",
            reading.id,
            assessment.outputs.len(),
            assessment.verdicts.len(),
            assessment.breaches().count(),
            anomalies.len()
        );

        Ok(ReadingOutcome {
            assessment,
            anomalies,
        })
    }

    /// Classify a stored reading against the current limits without
    /// touching the reading or generating anomalies.
    #[instrument(skip(self))]
    pub async fn reclassify(
        &self,
        reading_id: ReadingId,
    ) -> Result<ReadingAssessment, PipelineError> {
        // ---
        let reading = self
            .store
            .reading(reading_id)
            .await?
            .ok_or(PipelineError::UnknownReading(reading_id))?;

        let snapshot = self
            .store
            .instrument_snapshot(reading.instrument_id)
            .await?
            .ok_or(PipelineError::UnknownInstrument(reading.instrument_id))?;

        assess(&snapshot, &reading, &self.config).map_err(|source| PipelineError::Rejected {
            reading_id,
            source,
        })
    }

    /// Authoring-time check of a whole instrument under this pipeline's
    /// chaining policy.
    pub fn validate_instrument(
        &self,
        instrument: &Instrument,
    ) -> Result<(), Vec<DefinitionError>> {
        validate_instrument(instrument, self.config.allow_output_chaining)
    }
}
