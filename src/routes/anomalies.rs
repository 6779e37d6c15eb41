//! Manual anomaly entry point and status workflow endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{patch, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::info;

use super::{ApiError, AppState};
use crate::engine::anomaly::{self, ManualAnomaly};
use crate::models::{Anomaly, AnomalyCreated, AnomalyId, AnomalyStatus};

// ---

#[derive(Debug, Deserialize)]
struct StatusChange {
    status: AnomalyStatus,
}

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/anomalies", post(create))
        .route("/anomalies/{id}/status", patch(change_status))
}

/// Handle `POST /anomalies`: record a user-reported anomaly.
async fn create(
    State(pipeline): State<AppState>,
    Json(request): Json<ManualAnomaly>,
) -> Result<(StatusCode, Json<AnomalyCreated>), ApiError> {
    // ---
    info!("POST /anomalies - instrument {}", request.instrument_id);
    let anomaly = anomaly::create_manual(pipeline.store(), request).await?;
    Ok((StatusCode::CREATED, Json(AnomalyCreated::from(&anomaly))))
}

/// Handle `PATCH /anomalies/{id}/status`.
async fn change_status(
    State(pipeline): State<AppState>,
    Path(id): Path<AnomalyId>,
    Json(change): Json<StatusChange>,
) -> Result<Json<Anomaly>, ApiError> {
    // ---
    info!("PATCH /anomalies/{}/status -> {}", id, change.status.as_str());
    let anomaly = anomaly::transition(pipeline.store(), id, change.status).await?;
    Ok(Json(anomaly))
}
