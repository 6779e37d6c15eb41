//! Instrumentation computation and limit-based anomaly engine.
//!
//! Stages, leaf first: [`expr`] parses and evaluates formulas, [`binder`]
//! builds the variable context for a reading, [`resolver`] computes outputs,
//! [`limits`] classifies them, [`anomaly`] records breaches, and
//! [`pipeline`] runs them in order for one reading.

pub mod anomaly;
pub mod binder;
pub mod definition;
pub mod expr;
pub mod limits;
pub mod pipeline;
pub mod resolver;

pub use pipeline::{assess, validate_formula, PipelineError, ReadingPipeline, SubmitReading};
