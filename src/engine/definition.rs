//! Authoring-time checks for a whole instrument definition.
//!
//! Runs before an instrument, input, constant or output is persisted so that
//! binding and evaluation never meet an ambiguous or unparsable definition.

use std::collections::BTreeSet;

use serde::Serialize;
use thiserror::Error;

use crate::engine::expr::{self, Formula, SyntaxError};
use crate::engine::resolver::{dependency_order, output_dependencies};
use crate::models::{Instrument, Output};

// ---

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DefinitionError {
    #[error("'{acronym}' is not a valid formula identifier")]
    InvalidAcronym { acronym: String },

    #[error("acronym '{acronym}' is used more than once")]
    DuplicateAcronym { acronym: String },

    #[error("formula of output '{output}' is invalid: {error}")]
    InvalidFormula { output: String, error: SyntaxError },

    #[error("formula of output '{output}' is part of a reference cycle")]
    FormulaCycle { output: String },

    #[error("primary output '{acronym}' is not an output of the instrument")]
    UnknownPrimaryOutput { acronym: String },
}

/// Validate every acronym and formula of `instrument`.
///
/// Collects all problems rather than stopping at the first one.
pub fn validate_instrument(
    instrument: &Instrument,
    allow_chaining: bool,
) -> Result<(), Vec<DefinitionError>> {
    // ---
    let mut errors = Vec::new();

    let acronyms = instrument
        .inputs
        .iter()
        .map(|i| i.acronym.as_str())
        .chain(instrument.constants.iter().map(|c| c.acronym.as_str()))
        .chain(instrument.outputs.iter().map(|o| o.acronym.as_str()));

    let mut seen = BTreeSet::new();
    for acronym in acronyms {
        if !expr::is_identifier(acronym) {
            errors.push(DefinitionError::InvalidAcronym {
                acronym: acronym.to_string(),
            });
        } else if !seen.insert(acronym) {
            errors.push(DefinitionError::DuplicateAcronym {
                acronym: acronym.to_string(),
            });
        }
    }

    // Variables a formula may see.
    let mut known: Vec<&str> = instrument
        .inputs
        .iter()
        .map(|i| i.acronym.as_str())
        .chain(instrument.constants.iter().map(|c| c.acronym.as_str()))
        .collect();
    if allow_chaining {
        known.extend(instrument.outputs.iter().map(|o| o.acronym.as_str()));
    }

    let parsed: Vec<(&Output, Result<Formula, SyntaxError>)> = instrument
        .outputs
        .iter()
        .map(|o| (o, expr::validate(&o.formula, &known)))
        .collect();

    for (output, result) in &parsed {
        if let Err(error) = result {
            errors.push(DefinitionError::InvalidFormula {
                output: output.acronym.clone(),
                error: error.clone(),
            });
        }
    }

    if allow_chaining {
        let deps = output_dependencies(instrument, &parsed);
        let ordering = dependency_order(&deps);
        for idx in ordering.cyclic {
            errors.push(DefinitionError::FormulaCycle {
                output: parsed[idx].0.acronym.clone(),
            });
        }
    }

    if let Some(primary) = &instrument.primary_output {
        if !instrument.outputs.iter().any(|o| &o.acronym == primary) {
            errors.push(DefinitionError::UnknownPrimaryOutput {
                acronym: primary.clone(),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
