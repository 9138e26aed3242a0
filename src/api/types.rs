//! API request and response types.

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// Body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub detail: String,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `healthy` while the server answers
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// Handler error carrying its HTTP status.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: "Task not found".to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
            StoreError::Network { .. } => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            detail: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            detail: rejection.body_text(),
        }
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self {
            status: rejection.status(),
            detail: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { detail: self.detail })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskId, TaskStatus, Transition};

    #[test]
    fn test_store_errors_map_to_status_codes() {
        let not_found = ApiError::from(StoreError::NotFound(TaskId::new()));
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);
        assert_eq!(not_found.detail, "Task not found");

        let rejected = ApiError::from(StoreError::InvalidTransition {
            action: Transition::Resume,
            from: Some(TaskStatus::Pending),
        });
        assert_eq!(rejected.status, StatusCode::BAD_REQUEST);
        assert_eq!(rejected.detail, "Task is not paused");

        let upstream = ApiError::from(StoreError::network("connection refused"));
        assert_eq!(upstream.status, StatusCode::BAD_GATEWAY);
        assert_eq!(upstream.detail, "connection refused");
    }
}
