//! `codemetal-damwatch`: formula evaluation, limit classification and
//! anomaly generation for dam instrumentation.
//!
//! The engine is a library-style boundary invoked in-process; the `damwatch`
//! binary wraps it in an Axum service backed by PostgreSQL.
//!
//! This crate follows the Explicit Module Boundary Pattern (EMBP): `config`
//! parses configuration, `schema` owns the database layout, `store` is the
//! storage boundary, `engine` holds the computation stages and `routes` is
//! the HTTP gateway.

pub mod config;
pub mod engine;
pub mod models;
pub mod routes;
pub mod schema;
pub mod store;

#[cfg(test)]
mod test_support;

pub use config::{Config, EngineConfig};
pub use engine::{PipelineError, ReadingPipeline, SubmitReading};
pub use store::{MemoryStore, MonitoringStore, PgStore};
