//! HTTP mapping of settlement errors

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::error::SettlementError;

/// Error response body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_status: Option<String>,
}

#[derive(Debug)]
pub struct ApiError(pub SettlementError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<SettlementError> for ApiError {
    fn from(e: SettlementError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self(SettlementError::validation(format!("invalid request body: {}", e.body_text())))
    }
}

impl From<PathRejection> for ApiError {
    fn from(e: PathRejection) -> Self {
        Self(SettlementError::validation(format!("invalid path: {}", e.body_text())))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        Self(SettlementError::validation(format!("invalid query: {}", e.body_text())))
    }
}

pub fn status_code(e: &SettlementError) -> StatusCode {
    match e {
        SettlementError::Validation(_)
        | SettlementError::Verification(_)
        | SettlementError::CancellationClosed { .. } => StatusCode::BAD_REQUEST,
        SettlementError::NotFound { .. } => StatusCode::NOT_FOUND,
        SettlementError::InvalidState { .. } | SettlementError::Replay(_) => StatusCode::CONFLICT,
        SettlementError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        SettlementError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        SettlementError::External { .. } => StatusCode::BAD_GATEWAY,
        SettlementError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        SettlementError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_code(&self.0);
        // Storage details stay in the logs
        let message = match &self.0 {
            SettlementError::Storage(detail) => {
                error!(error = %detail, "Storage error while serving request");
                "internal storage error".to_string()
            }
            e => e.to_string(),
        };

        let body = ErrorResponse {
            error: message,
            code: self.0.code().to_string(),
            current_status: self.0.current_status().map(str::to_string),
        };

        (status, Json(body)).into_response()
    }
}
