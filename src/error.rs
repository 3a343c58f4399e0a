use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Failure taxonomy for the launch/grading/gating core.
///
/// Launch validation and session failures are deliberately flattened to a
/// generic 400 at the boundary so a caller cannot probe which sub-check
/// failed; the detail goes to tracing only.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("no active tool registration")]
    Configuration,
    #[error("launch validation failed: {0}")]
    Validation(String),
    #[error("session not found or expired")]
    Session,
    #[error("score must be a number between 0 and 1")]
    InvalidScore,
    #[error("student is not enrolled in this course")]
    Enrollment,
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("directory service unavailable")]
    Unavailable,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            AppError::Configuration | AppError::Validation(_) => {
                tracing::warn!(error = %self, "rejected LTI launch");
                (StatusCode::BAD_REQUEST, "Invalid LTI launch request".to_string())
            }
            AppError::Session => (StatusCode::BAD_REQUEST, "No active LTI session".to_string()),
            AppError::InvalidScore => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Enrollment | AppError::Forbidden(_) => {
                (StatusCode::FORBIDDEN, self.to_string())
            }
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            AppError::Db(e) => {
                tracing::error!(error = %e, "database error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
            AppError::Internal(e) => {
                tracing::error!(error = %e, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": msg }))).into_response()
    }
}
