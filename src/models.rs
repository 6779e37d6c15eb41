//! Domain models for the dam instrumentation engine.
//!
//! Instruments own their Inputs, Constants and Outputs; Readings carry the
//! per-submission input values; limits and anomalies reference both. These
//! types are shared by the engine stages, the storage boundary and the HTTP
//! routes, so they all derive `Serialize`/`Deserialize`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---

pub type DamId = Uuid;
pub type InstrumentId = Uuid;
pub type OutputId = Uuid;
pub type ReadingId = Uuid;
pub type AnomalyId = Uuid;
pub type DangerLevelId = i32;

/// A raw measured quantity reported by an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
    pub id: Uuid,
    pub name: String,
    pub acronym: String,
}

/// A calibration value fixed per instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constant {
    pub id: Uuid,
    pub name: String,
    pub acronym: String,
    pub value: f64,
}

/// A derived quantity computed from a formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub id: OutputId,
    pub name: String,
    pub acronym: String,
    pub formula: String,
}

/// A physical sensor or device installed on a dam.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    // ---
    pub id: InstrumentId,
    pub dam_id: DamId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub inputs: Vec<Input>,
    pub constants: Vec<Constant>,
    pub outputs: Vec<Output>,

    /// Output checked against the deterministic limit when the engine runs
    /// with the `primary_output` scope.
    #[serde(default)]
    pub primary_output: Option<String>,
}

// ---

/// Which side of an interval a value fell outside of.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "side", content = "value", rename_all = "snake_case")]
pub enum ViolatedBound {
    Lower(f64),
    Upper(f64),
}

/// A closed interval with optional ends.
///
/// An end that is `None` is unbounded. An interval with neither end, or with
/// a non-finite end, or with `lower > upper` is malformed and must be treated
/// as "no limit configured".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl Interval {
    pub fn new(lower: Option<f64>, upper: Option<f64>) -> Self {
        Self { lower, upper }
    }

    pub fn closed(lower: f64, upper: f64) -> Self {
        Self::new(Some(lower), Some(upper))
    }

    /// `true` when the interval can be used for classification.
    pub fn is_usable(&self) -> bool {
        // ---
        if self.lower.is_none() && self.upper.is_none() {
            return false;
        }
        if self.lower.is_some_and(|v| !v.is_finite()) || self.upper.is_some_and(|v| !v.is_finite())
        {
            return false;
        }
        match (self.lower, self.upper) {
            (Some(lo), Some(hi)) => lo <= hi,
            _ => true,
        }
    }

    /// Check `value` against the interval. Both ends are inclusive.
    pub fn check(&self, value: f64) -> Result<(), ViolatedBound> {
        // ---
        if let Some(lo) = self.lower {
            if value < lo {
                return Err(ViolatedBound::Lower(lo));
            }
        }
        if let Some(hi) = self.upper {
            if value > hi {
                return Err(ViolatedBound::Upper(hi));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lo = self.lower.map_or("-inf".to_string(), |v| v.to_string());
        let hi = self.upper.map_or("+inf".to_string(), |v| v.to_string());
        write!(f, "[{lo}, {hi}]")
    }
}

/// Fixed min/max bound, at most one per instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeterministicLimit {
    pub id: Uuid,
    pub instrument_id: InstrumentId,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl DeterministicLimit {
    pub fn interval(&self) -> Interval {
        Interval::new(self.lower, self.upper)
    }
}

/// Bound derived externally from historical behavior, one per output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticalLimit {
    pub id: Uuid,
    pub output_id: OutputId,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl StatisticalLimit {
    pub fn interval(&self) -> Interval {
        Interval::new(self.lower, self.upper)
    }
}

/// Everything the engine needs to know about one instrument, read once per
/// pipeline invocation so limit edits never land mid-classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSnapshot {
    pub instrument: Instrument,
    pub deterministic_limit: Option<DeterministicLimit>,
    #[serde(default)]
    pub statistical_limits: Vec<StatisticalLimit>,
}

impl InstrumentSnapshot {
    pub fn statistical_limit_for(&self, output_id: OutputId) -> Option<&StatisticalLimit> {
        self.statistical_limits
            .iter()
            .find(|l| l.output_id == output_id)
    }
}

// ---

/// One timestamped submission of input values for an instrument.
///
/// Readings are append-only: nothing in the engine mutates one after it has
/// been stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub id: ReadingId,
    pub instrument_id: InstrumentId,
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
}

impl Reading {
    pub fn new(
        instrument_id: InstrumentId,
        timestamp: DateTime<Utc>,
        values: BTreeMap<String, f64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            instrument_id,
            timestamp,
            values,
        }
    }
}

// ---

/// Ordered severity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DangerLevel {
    pub id: DangerLevelId,
    pub name: &'static str,
    pub rank: u8,
}

/// Built-in danger level reference data, ordered by rank.
pub const DANGER_LEVELS: [DangerLevel; 4] = [
    DangerLevel { id: 1, name: "Normal", rank: 0 },
    DangerLevel { id: 2, name: "Attention", rank: 1 },
    DangerLevel { id: 3, name: "Alert", rank: 2 },
    DangerLevel { id: 4, name: "Emergency", rank: 3 },
];

impl DangerLevel {
    pub fn by_id(id: DangerLevelId) -> Option<DangerLevel> {
        DANGER_LEVELS.iter().copied().find(|l| l.id == id)
    }
}

// ---

/// Workflow state of an anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyStatus {
    Open,
    InProgress,
    Resolved,
    Closed,
}

impl AnomalyStatus {
    /// Stable reference-data id, matching the `anomaly_statuses` seed.
    pub fn id(self) -> i32 {
        match self {
            AnomalyStatus::Open => 1,
            AnomalyStatus::InProgress => 2,
            AnomalyStatus::Resolved => 3,
            AnomalyStatus::Closed => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AnomalyStatus::Open => "OPEN",
            AnomalyStatus::InProgress => "IN_PROGRESS",
            AnomalyStatus::Resolved => "RESOLVED",
            AnomalyStatus::Closed => "CLOSED",
        }
    }

    /// Open anomalies hold their breach key.
    pub fn is_open(self) -> bool {
        matches!(self, AnomalyStatus::Open | AnomalyStatus::InProgress)
    }

    pub fn can_transition_to(self, next: AnomalyStatus) -> bool {
        // ---
        use AnomalyStatus::*;
        matches!(
            (self, next),
            (Open, InProgress)
                | (Open, Resolved)
                | (Open, Closed)
                | (InProgress, Resolved)
                | (InProgress, Closed)
                | (Resolved, Closed)
        )
    }
}

impl FromStr for AnomalyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(AnomalyStatus::Open),
            "IN_PROGRESS" => Ok(AnomalyStatus::InProgress),
            "RESOLVED" => Ok(AnomalyStatus::Resolved),
            "CLOSED" => Ok(AnomalyStatus::Closed),
            other => Err(format!("unknown anomaly status '{other}'")),
        }
    }
}

/// Whether an anomaly was raised by the engine or reported by a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyOrigin {
    Automatic,
    Manual,
}

impl AnomalyOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            AnomalyOrigin::Automatic => "AUTOMATIC",
            AnomalyOrigin::Manual => "MANUAL",
        }
    }
}

impl FromStr for AnomalyOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUTOMATIC" => Ok(AnomalyOrigin::Automatic),
            "MANUAL" => Ok(AnomalyOrigin::Manual),
            other => Err(format!("unknown anomaly origin '{other}'")),
        }
    }
}

/// The kind of limit a value broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreachKind {
    Deterministic,
    Statistical,
}

impl BreachKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BreachKind::Deterministic => "DETERMINISTIC",
            BreachKind::Statistical => "STATISTICAL",
        }
    }
}

impl FromStr for BreachKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DETERMINISTIC" => Ok(BreachKind::Deterministic),
            "STATISTICAL" => Ok(BreachKind::Statistical),
            other => Err(format!("unknown breach kind '{other}'")),
        }
    }
}

/// Identity of an ongoing breach; at most one open automatic anomaly may
/// hold a given key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BreachKey {
    pub instrument_id: InstrumentId,
    pub kind: BreachKind,
    pub output: String,
}

/// A recorded safety event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    // ---
    pub id: AnomalyId,
    pub instrument_id: InstrumentId,
    pub dam_id: DamId,
    pub reading_id: Option<ReadingId>,
    pub origin: AnomalyOrigin,
    pub breach_kind: Option<BreachKind>,
    pub breach_output: Option<String>,
    pub observation: String,
    pub observed_value: Option<f64>,
    pub danger_level_id: DangerLevelId,
    pub status: AnomalyStatus,
    pub created_at: DateTime<Utc>,
}

impl Anomaly {
    /// Dedup key; only automatic anomalies carry one.
    pub fn breach_key(&self) -> Option<BreachKey> {
        // ---
        if self.origin != AnomalyOrigin::Automatic {
            return None;
        }
        match (self.breach_kind, &self.breach_output) {
            (Some(kind), Some(output)) => Some(BreachKey {
                instrument_id: self.instrument_id,
                kind,
                output: output.clone(),
            }),
            _ => None,
        }
    }
}

/// Outbound record consumed by anomaly persistence and alerting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyCreated {
    pub anomaly_id: AnomalyId,
    pub instrument_id: InstrumentId,
    pub dam_id: DamId,
    pub reading_id: Option<ReadingId>,
    pub danger_level_id: DangerLevelId,
    pub status_id: i32,
    pub status: AnomalyStatus,
    pub origin: AnomalyOrigin,
    pub observation: String,
    pub observed_value: Option<f64>,
    pub breach_kind: Option<BreachKind>,
    pub output: Option<String>,
}

impl From<&Anomaly> for AnomalyCreated {
    fn from(a: &Anomaly) -> Self {
        Self {
            anomaly_id: a.id,
            instrument_id: a.instrument_id,
            dam_id: a.dam_id,
            reading_id: a.reading_id,
            danger_level_id: a.danger_level_id,
            status_id: a.status.id(),
            status: a.status,
            origin: a.origin,
            observation: a.observation.clone(),
            observed_value: a.observed_value,
            breach_kind: a.breach_kind,
            output: a.breach_output.clone(),
        }
    }
}
