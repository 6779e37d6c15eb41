//! Runs every output formula of an instrument against a bound context.
//!
//! Failures are recorded per output and never stop the remaining outputs
//! from being computed. By default output formulas see only inputs and
//! constants; with chaining enabled, outputs may reference each other and
//! are evaluated in dependency order.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::engine::binder::VariableContext;
use crate::engine::expr::{EvalError, Formula, SyntaxError};
use crate::models::{Instrument, Output};

// ---

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum OutputErrorKind {
    #[error("formula does not parse: {0}")]
    Syntax(SyntaxError),

    #[error("evaluation failed: {0}")]
    Eval(EvalError),

    #[error("formula is part of a reference cycle")]
    Cycle,

    #[error("depends on output '{dependency}' which could not be computed")]
    DependencyFailed { dependency: String },
}

/// An output that could not be computed for this reading.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("output '{output}': {kind}")]
pub struct OutputError {
    pub output: String,
    pub kind: OutputErrorKind,
}

/// Values for the outputs that could be computed, plus the ones that
/// could not.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Resolution {
    pub values: BTreeMap<String, f64>,
    pub errors: Vec<OutputError>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Evaluate every output of `instrument` against `context`.
pub fn resolve(
    instrument: &Instrument,
    context: &VariableContext,
    allow_chaining: bool,
) -> Resolution {
    // ---
    let parsed: Vec<(&Output, Result<Formula, SyntaxError>)> = instrument
        .outputs
        .iter()
        .map(|o| (o, Formula::parse(&o.formula)))
        .collect();

    let resolution = if allow_chaining {
        resolve_chained(instrument, &parsed, context)
    } else {
        resolve_flat(&parsed, context)
    };

    for err in &resolution.errors {
        warn!("Instrument {}: {}", instrument.id, err);
    }
    debug!(
        "Instrument {}: resolved {} of {} outputs",
        instrument.id,
        resolution.values.len(),
        instrument.outputs.len()
    );
    resolution
}

fn resolve_flat(
    parsed: &[(&Output, Result<Formula, SyntaxError>)],
    context: &VariableContext,
) -> Resolution {
    // ---
    let mut resolution = Resolution::default();

    for (output, formula) in parsed {
        let result = match formula {
            Ok(f) => f.evaluate(context).map_err(OutputErrorKind::Eval),
            Err(e) => Err(OutputErrorKind::Syntax(e.clone())),
        };
        match result {
            Ok(value) => {
                resolution.values.insert(output.acronym.clone(), value);
            }
            Err(kind) => resolution.errors.push(OutputError {
                output: output.acronym.clone(),
                kind,
            }),
        }
    }
    resolution
}

fn resolve_chained(
    instrument: &Instrument,
    parsed: &[(&Output, Result<Formula, SyntaxError>)],
    context: &VariableContext,
) -> Resolution {
    // ---
    let deps = output_dependencies(instrument, parsed);
    let ordering = dependency_order(&deps);

    let mut ctx = context.clone();
    let mut resolution = Resolution::default();
    let mut failed: BTreeSet<usize> = BTreeSet::new();

    for &idx in &ordering.order {
        let (output, formula) = &parsed[idx];

        let result = if let Some(&dep) = deps[idx].iter().find(|d| failed.contains(d)) {
            Err(OutputErrorKind::DependencyFailed {
                dependency: parsed[dep].0.acronym.clone(),
            })
        } else {
            match formula {
                Ok(f) => f.evaluate(&ctx).map_err(OutputErrorKind::Eval),
                Err(e) => Err(OutputErrorKind::Syntax(e.clone())),
            }
        };

        match result {
            Ok(value) => {
                // Acronyms are unique per instrument, so this never shadows.
                ctx.insert_derived(&output.acronym, value);
                resolution.values.insert(output.acronym.clone(), value);
            }
            Err(kind) => {
                failed.insert(idx);
                resolution.errors.push(OutputError {
                    output: output.acronym.clone(),
                    kind,
                });
            }
        }
    }

    for &idx in &ordering.blocked {
        let kind = if ordering.cyclic.contains(&idx) {
            OutputErrorKind::Cycle
        } else {
            let dep = deps[idx]
                .iter()
                .copied()
                .find(|d| ordering.blocked.contains(d) || failed.contains(d))
                .unwrap_or(idx);
            OutputErrorKind::DependencyFailed {
                dependency: parsed[dep].0.acronym.clone(),
            }
        };
        resolution.errors.push(OutputError {
            output: parsed[idx].0.acronym.clone(),
            kind,
        });
    }

    // Report errors in definition order regardless of evaluation order.
    let position = |acronym: &str| {
        instrument
            .outputs
            .iter()
            .position(|o| o.acronym == acronym)
            .unwrap_or(usize::MAX)
    };
    resolution.errors.sort_by_key(|e| position(&e.output));
    resolution
}

/// For each output (by index), the indices of other outputs its formula
/// references. Outputs whose formula does not parse have no dependencies.
pub(crate) fn output_dependencies(
    instrument: &Instrument,
    parsed: &[(&Output, Result<Formula, SyntaxError>)],
) -> Vec<Vec<usize>> {
    // ---
    parsed
        .iter()
        .map(|(_, formula)| match formula {
            Ok(f) => instrument
                .outputs
                .iter()
                .enumerate()
                .filter(|(_, o)| f.references(&o.acronym))
                .map(|(i, _)| i)
                .collect(),
            Err(_) => Vec::new(),
        })
        .collect()
}

/// Result of ordering outputs by their references to each other.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct DependencyOrder {
    /// Evaluation order, dependencies first.
    pub order: Vec<usize>,
    /// Outputs that can never be ordered: on a cycle or downstream of one.
    pub blocked: BTreeSet<usize>,
    /// The subset of `blocked` that lies on a cycle.
    pub cyclic: BTreeSet<usize>,
}

/// Kahn's algorithm over `deps[i]` = outputs that `i` reads.
pub(crate) fn dependency_order(deps: &[Vec<usize>]) -> DependencyOrder {
    // ---
    let n = deps.len();
    let mut in_degree: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, ds) in deps.iter().enumerate() {
        for &d in ds {
            dependents[d].push(i);
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(node) = queue.pop_front() {
        order.push(node);
        for &child in &dependents[node] {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                queue.push_back(child);
            }
        }
    }

    let blocked: BTreeSet<usize> = (0..n).filter(|i| in_degree[*i] > 0).collect();
    let cyclic = blocked
        .iter()
        .copied()
        .filter(|&start| reaches(deps, &blocked, start, start))
        .collect();

    DependencyOrder {
        order,
        blocked,
        cyclic,
    }
}

/// Whether `target` is reachable from `from` through at least one edge,
/// staying inside `within`.
fn reaches(deps: &[Vec<usize>], within: &BTreeSet<usize>, from: usize, target: usize) -> bool {
    // ---
    let mut seen = BTreeSet::new();
    let mut stack: Vec<usize> = deps[from].clone();
    while let Some(node) = stack.pop() {
        if node == target {
            return true;
        }
        if within.contains(&node) && seen.insert(node) {
            stack.extend(deps[node].iter().copied());
        }
    }
    false
}
