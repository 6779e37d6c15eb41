//! Reading ingestion and reclassification endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::info;

use super::{ApiError, AppState};
use crate::engine::pipeline::{ReadingAssessment, ReadingOutcome};
use crate::models::ReadingId;
use crate::SubmitReading;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/readings", post(submit))
        .route("/readings/{id}/classification", get(classification))
}

/// Handle `POST /readings`: store the reading and run the pipeline.
async fn submit(
    State(pipeline): State<AppState>,
    Json(request): Json<SubmitReading>,
) -> Result<(StatusCode, Json<ReadingOutcome>), ApiError> {
    // ---
    info!("POST /readings - instrument {}", request.instrument_id);
    let outcome = pipeline.submit_reading(request).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// Handle `GET /readings/{id}/classification`: classify a stored reading
/// against the current limits.
async fn classification(
    State(pipeline): State<AppState>,
    Path(id): Path<ReadingId>,
) -> Result<Json<ReadingAssessment>, ApiError> {
    // ---
    info!("GET /readings/{}/classification", id);
    Ok(Json(pipeline.reclassify(id).await?))
}
