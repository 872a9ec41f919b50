use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Per-stage error entry surfaced in the response `errors[]` list.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct StageError {
    pub stage: String,
    pub msg: String,
}

impl StageError {
    pub fn new(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self { stage: stage.into(), msg: msg.into() }
    }
}

/// API error taxonomy for the analyze pipeline.
///
/// Design: uses thiserror for ergonomic error handling with context.
/// Each variant maps to exactly one transport status so handlers never
/// pick status codes ad hoc.
#[derive(Error, Debug)]
pub enum ApiError {
    // Unsupported request shape -> 400
    #[error("Not supported: {0}")]
    NotSupported(String),

    // Validation errors -> 422
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Identity resolution errors -> 502
    #[error("Unidentifiable image: {0}")]
    UnidentifiableImage(String),

    // Dependency preflight errors -> 503
    #[error("Dependency unavailable: {service}")]
    DependencyUnavailable { service: String },

    // Verified persistence mismatch -> 500
    #[error("Upsert mismatch for image {image_id}")]
    UpsertMismatch { image_id: String, errors: Vec<StageError> },

    // Any uncaught stage failure -> 500 with the stage tag attached
    #[error("Stage '{stage}' failed: {msg}")]
    StageFailure { stage: String, msg: String, errors: Vec<StageError> },

    // Generic wrapper for other errors - auto-convert from anyhow::Error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ApiError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported(message.into())
    }

    pub fn unidentifiable_image(message: impl Into<String>) -> Self {
        Self::UnidentifiableImage(message.into())
    }

    pub fn dependency_unavailable(service: impl Into<String>) -> Self {
        Self::DependencyUnavailable { service: service.into() }
    }

    pub fn upsert_mismatch(image_id: impl Into<String>, errors: Vec<StageError>) -> Self {
        Self::UpsertMismatch { image_id: image_id.into(), errors }
    }

    pub fn stage_failure(
        stage: impl Into<String>,
        msg: impl Into<String>,
        errors: Vec<StageError>,
    ) -> Self {
        Self::StageFailure { stage: stage.into(), msg: msg.into(), errors }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::NotSupported(msg) => {
                (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "detail": msg })))
                    .into_response()
            },
            Self::InvalidInput(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, Json(serde_json::json!({ "detail": msg })))
                    .into_response()
            },
            Self::UnidentifiableImage(msg) => {
                (StatusCode::BAD_GATEWAY, Json(serde_json::json!({ "detail": msg })))
                    .into_response()
            },
            Self::DependencyUnavailable { service } => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "ok": false, "where": service })),
            )
                .into_response(),
            Self::UpsertMismatch { image_id, errors } => {
                tracing::error!("finding upsert mismatch for image_id={}", image_id);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "ok": false, "errors": errors })),
                )
                    .into_response()
            },
            Self::StageFailure { stage, msg, errors } => {
                tracing::error!("pipeline stage '{}' failed: {}", stage, msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "ok": false, "errors": errors })),
                )
                    .into_response()
            },
            Self::Other(err) => {
                tracing::error!("internal error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "detail": err.to_string() })),
                )
                    .into_response()
            },
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Other(anyhow::anyhow!("JSON serialization error: {}", err))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
