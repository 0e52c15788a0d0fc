//! HTTP error mapping.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pairlink_core::LinkError;
use serde_json::json;
use tracing::error;

/// Failure of an API request.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The lifecycle refused or failed the request.
    #[error(transparent)]
    Link(#[from] LinkError),
    /// The request body was not the expected JSON.
    #[error("Invalid request body: {0}")]
    BadBody(String),
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadBody(_) | Self::Link(LinkError::Validation(_)) => StatusCode::BAD_REQUEST,
            Self::Link(e) => match e {
                LinkError::Conflict(_) => StatusCode::CONFLICT,
                LinkError::Capacity { .. } => StatusCode::TOO_MANY_REQUESTS,
                LinkError::ConnectionCreation { .. } | LinkError::PairingRequest(_) => {
                    StatusCode::BAD_GATEWAY
                }
                LinkError::NotFound(_) => StatusCode::NOT_FOUND,
                LinkError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
                LinkError::Validation(_) | LinkError::Delivery(_) | LinkError::Cleanup(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    /// Category string reported to clients.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Link(e) => e.category(),
            Self::BadBody(_) => "validation",
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadBody(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, category = self.category(), "request failed");
        }
        let body = json!({ "error": self.to_string(), "category": self.category() });
        (status, Json(body)).into_response()
    }
}
