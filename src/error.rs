//! Error taxonomy surfaced to operators (spec §7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};
use thiserror::Error;

/// Classification of an error as surfaced through the Hub HTTP surface
/// and through job/recovery decision points.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("scheduling conflict: {0}")]
    Conflict(String),

    #[error("external system unavailable: {0}")]
    ExternalUnavailable(String),

    #[error("external system reported failure: {0}")]
    ExternalFailure(String),

    #[error("data inconsistency: {0}")]
    DataInconsistency(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::Conflict(_) => "conflict",
            AppError::ExternalUnavailable(_) => "external_unavailable",
            AppError::ExternalFailure(_) => "external_failure",
            AppError::DataInconsistency(_) => "data_inconsistency",
            AppError::Internal(_) | AppError::Database(_) => "internal",
        }
    }

    pub fn with_details(self, details: Value) -> AppErrorWithDetails {
        AppErrorWithDetails {
            error: self,
            details: Some(details),
        }
    }
}

/// An `AppError` paired with optional structured details, the shape every
/// terminal failure carries (spec §7).
#[derive(Debug)]
pub struct AppErrorWithDetails {
    pub error: AppError,
    pub details: Option<Value>,
}

pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ExternalUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::ExternalFailure(_) => StatusCode::BAD_GATEWAY,
            AppError::DataInconsistency(_) => StatusCode::CONFLICT,
            AppError::Internal(_) | AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
