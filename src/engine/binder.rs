//! Builds the evaluation context for one instrument and reading.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use crate::engine::expr::Bindings;
use crate::models::{Instrument, Reading};

// ---

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BindError {
    #[error("reading has no value for input '{acronym}'")]
    MissingInputValue { acronym: String },

    #[error("acronym '{acronym}' is defined more than once on the instrument")]
    AcronymCollision { acronym: String },

    #[error("reading belongs to a different instrument")]
    InstrumentMismatch,
}

/// Name to value mapping of constants and input values for one reading.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableContext {
    values: BTreeMap<String, f64>,
}

impl VariableContext {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Add a computed value; used for output chaining. Returns `false` and
    /// leaves the context untouched if the name is already bound.
    pub(crate) fn insert_derived(&mut self, name: &str, value: f64) -> bool {
        // ---
        if self.values.contains_key(name) {
            return false;
        }
        self.values.insert(name.to_string(), value);
        true
    }
}

impl Bindings for VariableContext {
    fn lookup(&self, name: &str) -> Option<f64> {
        self.get(name)
    }
}

/// Merge the instrument's constants with the reading's input values.
///
/// Every input defined on the instrument must have a value. Submitted values
/// for acronyms that are not inputs of the instrument are ignored, so a
/// reading can never shadow a constant.
pub fn bind(instrument: &Instrument, reading: &Reading) -> Result<VariableContext, BindError> {
    // ---
    if reading.instrument_id != instrument.id {
        return Err(BindError::InstrumentMismatch);
    }

    let mut values = BTreeMap::new();

    for constant in &instrument.constants {
        if values
            .insert(constant.acronym.clone(), constant.value)
            .is_some()
        {
            return Err(BindError::AcronymCollision {
                acronym: constant.acronym.clone(),
            });
        }
    }

    for input in &instrument.inputs {
        let value = reading
            .values
            .get(&input.acronym)
            .copied()
            .ok_or_else(|| BindError::MissingInputValue {
                acronym: input.acronym.clone(),
            })?;

        if values.insert(input.acronym.clone(), value).is_some() {
            return Err(BindError::AcronymCollision {
                acronym: input.acronym.clone(),
            });
        }
    }

    let ignored = reading
        .values
        .keys()
        .filter(|k| !instrument.inputs.iter().any(|i| &i.acronym == *k))
        .count();
    if ignored > 0 {
        debug!(
            "Reading {} carries {} value(s) that are not inputs of instrument {}",
            reading.id, ignored, instrument.id
        );
    }

    Ok(VariableContext { values })
}
