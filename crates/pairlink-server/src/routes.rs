//! Request handlers.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use pairlink_runtime::StatusView;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::health::{self, HealthResponse};
use crate::server::AppState;

/// Body of `POST /api/request-pair-code`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRequest {
    /// Phone number in any common notation.
    #[serde(default)]
    pub phone_number: String,
}

/// Successful pairing-code response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairResponse {
    /// Always `true`.
    pub success: bool,
    /// Code to enter on the device.
    pub pairing_code: String,
    /// Human-readable instructions.
    pub message: String,
}

/// Response of `DELETE /api/cleanup-session/{phone}`.
#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    /// Always `true`; cleanup is idempotent.
    pub success: bool,
    /// Whether a session was torn down.
    pub removed: bool,
}

/// POST /api/request-pair-code
pub async fn request_pair_code(
    State(state): State<AppState>,
    body: Result<Json<PairRequest>, JsonRejection>,
) -> Result<Json<PairResponse>, ApiError> {
    let Json(request) = body?;
    let started = state.service.create_session(&request.phone_number).await?;
    let deadline = state.service.context().config.pairing_deadline.as_secs();
    Ok(Json(PairResponse {
        success: true,
        pairing_code: started.pairing_code,
        message: format!(
            "Enter this code under Linked Devices on your phone within {deadline} seconds."
        ),
    }))
}

/// GET /api/session-status/{phone}
pub async fn session_status(
    State(state): State<AppState>,
    Path(phone): Path<String>,
) -> Result<Json<StatusView>, ApiError> {
    Ok(Json(state.service.get_status(&phone)?))
}

/// DELETE /api/cleanup-session/{phone}
pub async fn cleanup_session(
    State(state): State<AppState>,
    Path(phone): Path<String>,
) -> Result<Json<CleanupResponse>, ApiError> {
    let removed = state.service.cleanup_session(&phone).await?;
    Ok(Json(CleanupResponse {
        success: true,
        removed,
    }))
}

/// GET /api/health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.service.active_count(),
    ))
}
