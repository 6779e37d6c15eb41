//! HTTP gateway for the `codemetal-damwatch` service.
//!
//! Each sibling module exports a subrouter; this gateway merges them and
//! attaches the shared pipeline so `main.rs` never needs to know about
//! individual endpoints (EMBP).

use std::sync::Arc;

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json, Router};
use serde_json::{json, Value};
use tracing::error;

use crate::engine::anomaly::AnomalyError;
use crate::engine::PipelineError;
use crate::ReadingPipeline;

mod anomalies;
mod formulas;
mod health;
mod readings;

// ---

/// State shared by every route.
pub type AppState = Arc<ReadingPipeline>;

pub fn router(pipeline: AppState) -> Router {
    // ---
    Router::new()
        .merge(readings::router())
        .merge(formulas::router())
        .merge(anomalies::router())
        .merge(health::router())
        .with_state(pipeline)
}

/// JSON error body with a status code.
#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn new(status: StatusCode, body: Value) -> Self {
        Self { status, body }
    }

    fn internal(err: &dyn std::error::Error) -> Self {
        error!("Request failed: {}", err);
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": "internal error" }),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        // ---
        match &err {
            PipelineError::UnknownInstrument(_) | PipelineError::UnknownReading(_) => {
                ApiError::new(StatusCode::NOT_FOUND, json!({ "error": err.to_string() }))
            }
            PipelineError::Rejected { reading_id, source } => ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({
                    "error": err.to_string(),
                    "reading_id": reading_id,
                    "reason": source.to_string(),
                }),
            ),
            PipelineError::Store(e) => ApiError::internal(e),
        }
    }
}

impl From<AnomalyError> for ApiError {
    fn from(err: AnomalyError) -> Self {
        // ---
        let status = match &err {
            AnomalyError::UnknownInstrument(_) | AnomalyError::NotFound(_) => StatusCode::NOT_FOUND,
            AnomalyError::UnknownDangerLevel(_) | AnomalyError::InvalidTransition { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AnomalyError::Conflict(_) => StatusCode::CONFLICT,
            AnomalyError::Store(e) => return ApiError::internal(e),
        };
        ApiError::new(status, json!({ "error": err.to_string() }))
    }
}
