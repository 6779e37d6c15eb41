//! Formula authoring endpoint.
//!
//! Called by the output-management collaborator before it persists an
//! output, so unparsable or out-of-grammar formulas are rejected at edit
//! time rather than at evaluation time.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::AppState;
use crate::engine::validate_formula;

// ---

#[derive(Debug, Deserialize)]
struct ValidateRequest {
    formula: String,
    /// Input and constant acronyms of the instrument.
    known_variables: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ValidateResponse {
    valid: bool,
    variables: Vec<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/formulas/validate", post(validate))
}

/// Handle `POST /formulas/validate`.
async fn validate(Json(request): Json<ValidateRequest>) -> Response {
    // ---
    match validate_formula(&request.formula, &request.known_variables) {
        Ok(formula) => {
            let variables = formula.variables().into_iter().map(String::from).collect();
            Json(ValidateResponse {
                valid: true,
                variables,
            })
            .into_response()
        }
        Err(err) => {
            debug!("Rejected formula {:?}: {}", request.formula, err);
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({
                    "valid": false,
                    "error": err.to_string(),
                    "token": err.offending_token(),
                    "position": err.position(),
                    "detail": err,
                })),
            )
                .into_response()
        }
    }
}
