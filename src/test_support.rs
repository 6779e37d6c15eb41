//! Shared fixtures for unit tests.

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use uuid::Uuid;

use crate::models::{
    Constant, DeterministicLimit, Input, Instrument, InstrumentSnapshot, Output, Reading,
    StatisticalLimit,
};

// ---

pub fn input(acronym: &str) -> Input {
    Input {
        id: Uuid::new_v4(),
        name: acronym.to_lowercase(),
        acronym: acronym.to_string(),
    }
}

pub fn constant(acronym: &str, value: f64) -> Constant {
    Constant {
        id: Uuid::new_v4(),
        name: acronym.to_lowercase(),
        acronym: acronym.to_string(),
        value,
    }
}

pub fn output(acronym: &str, formula: &str) -> Output {
    Output {
        id: Uuid::new_v4(),
        name: acronym.to_lowercase(),
        acronym: acronym.to_string(),
        formula: formula.to_string(),
    }
}

/// "Piezometer-1": input `P`, constant `K = 1.5`, output `Level = P * K`.
pub fn piezometer() -> Instrument {
    // ---
    Instrument {
        id: Uuid::new_v4(),
        dam_id: Uuid::new_v4(),
        name: "Piezometer-1".to_string(),
        kind: "piezometer".to_string(),
        inputs: vec![input("P")],
        constants: vec![constant("K", 1.5)],
        outputs: vec![output("Level", "P * K")],
        primary_output: None,
    }
}

pub fn deterministic(instrument: &Instrument, lower: f64, upper: f64) -> DeterministicLimit {
    DeterministicLimit {
        id: Uuid::new_v4(),
        instrument_id: instrument.id,
        lower: Some(lower),
        upper: Some(upper),
    }
}

pub fn statistical(
    instrument: &Instrument,
    acronym: &str,
    lower: f64,
    upper: f64,
) -> StatisticalLimit {
    // ---
    let output_id = instrument
        .outputs
        .iter()
        .find(|o| o.acronym == acronym)
        .map(|o| o.id)
        .expect("fixture output exists");
    StatisticalLimit {
        id: Uuid::new_v4(),
        output_id,
        lower: Some(lower),
        upper: Some(upper),
    }
}

pub fn snapshot(instrument: Instrument) -> InstrumentSnapshot {
    InstrumentSnapshot {
        instrument,
        deterministic_limit: None,
        statistical_limits: vec![],
    }
}

pub fn values(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

pub fn reading(instrument: &Instrument, pairs: &[(&str, f64)]) -> Reading {
    Reading::new(
        instrument.id,
        Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap(),
        values(pairs),
    )
}
