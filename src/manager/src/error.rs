use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bridge::ModuleError;
use serde::{Deserialize, Serialize};
use storage::StorageError;

/// Failure kinds surfaced by connector operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SystemError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl SystemError {
    pub fn connector_not_found(id: &str) -> Self {
        SystemError::NotFound(format!("Connector {id} not found"))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            SystemError::NotFound(_) => StatusCode::NOT_FOUND,
            SystemError::BadRequest(_) => StatusCode::BAD_REQUEST,
            SystemError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StorageError> for SystemError {
    fn from(err: StorageError) -> Self {
        SystemError::Internal(format!("storage error: {err}"))
    }
}

impl From<ModuleError> for SystemError {
    fn from(err: ModuleError) -> Self {
        SystemError::BadRequest(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContent {
    pub status: String,
    pub code: u16,
    pub message: String,
}

impl IntoResponse for SystemError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            SystemError::Internal(detail) => {
                tracing::error!(error = %detail, "connector operation failed");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorResponse {
            error: ErrorContent {
                status: status.canonical_reason().unwrap_or("Error").to_string(),
                code: status.as_u16(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_status_codes() {
        assert_eq!(
            SystemError::connector_not_found("x").status_code(),
            StatusCode::NOT_FOUND
        );
        let bad: SystemError = ModuleError::NotFound("Foo".into()).into();
        assert_eq!(bad.status_code(), StatusCode::BAD_REQUEST);
        let internal: SystemError = StorageError::Backend("disk".into()).into();
        assert_eq!(internal.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
