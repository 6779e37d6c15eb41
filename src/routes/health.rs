//! Liveness endpoint for the damwatch service.
//!
//! Used by container orchestrators and CI to check that the service answers
//! HTTP requests. It reports the build version and the engine policy the
//! process was started with, and does not touch the database.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use super::AppState;
use crate::config::EngineConfig;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    engine: EngineConfig,
}

/// Handle `GET /health`.
async fn health(State(pipeline): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        engine: *pipeline.config(),
    })
}

/// Create a subrouter containing the `/health` route.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
