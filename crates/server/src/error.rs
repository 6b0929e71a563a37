use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

use crate::db::StoreError;
use crate::llm::LlmError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("State conflict: {0}")]
    Conflict(String),

    #[error("LLM service unavailable: {0}")]
    LlmUnavailable(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    fn code_and_status(&self) -> (&'static str, StatusCode) {
        match self {
            ApiError::NotFound(_) => ("NOT_FOUND", StatusCode::NOT_FOUND),
            ApiError::InvalidRequest(_) => ("BAD_REQUEST", StatusCode::BAD_REQUEST),
            ApiError::Unauthorized => ("UNAUTHORIZED", StatusCode::UNAUTHORIZED),
            ApiError::Forbidden(_) => ("FORBIDDEN", StatusCode::FORBIDDEN),
            ApiError::Conflict(_) => ("CONFLICT", StatusCode::CONFLICT),
            ApiError::LlmUnavailable(_) => ("LLM_UNAVAILABLE", StatusCode::SERVICE_UNAVAILABLE),
            ApiError::PayloadTooLarge(_) => ("PAYLOAD_TOO_LARGE", StatusCode::PAYLOAD_TOO_LARGE),
            ApiError::Internal(_) => ("INTERNAL_SERVER_ERROR", StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, status) = self.code_and_status();

        // Internal details are logged server-side, never exposed to clients
        let message = match &self {
            ApiError::Internal(detail) => {
                tracing::error!("Internal error: {}", detail);
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound("resource not found".to_string()),
            StoreError::Conflict(detail) => ApiError::Conflict(detail),
            StoreError::Sqlite(e) => ApiError::Internal(e.to_string()),
            StoreError::Serialization(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<LlmError> for ApiError {
    fn from(err: LlmError) -> Self {
        ApiError::LlmUnavailable(err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::NotFound("x".into()).code_and_status().1,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Conflict("x".into()).code_and_status().1,
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::LlmUnavailable("x".into()).code_and_status().1,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Unauthorized.code_and_status().1,
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_store_error_conversion() {
        let api: ApiError = StoreError::NotFound.into();
        assert!(matches!(api, ApiError::NotFound(_)));

        let api: ApiError = StoreError::Conflict("file is processing".into()).into();
        assert!(matches!(api, ApiError::Conflict(_)));
    }
}
