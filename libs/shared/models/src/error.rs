use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Forbidden with machine-readable fields merged into the error body,
    /// for refusals a client is expected to recover from.
    #[error("Forbidden: {0}")]
    ForbiddenDetailed(String, serde_json::Value),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("External service error: {0}")]
    ExternalService(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message, details) = match &self {
            AppError::Auth(msg) => (StatusCode::UNAUTHORIZED, msg, None),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg, None),
            AppError::ForbiddenDetailed(msg, details) => (StatusCode::FORBIDDEN, msg, Some(details)),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg, None),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
            AppError::Database(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
            AppError::ExternalService(msg) => (StatusCode::BAD_GATEWAY, msg, None),
        };

        tracing::error!("Error: {}: {}", status, message);

        let mut body = json!({
            "error": message
        });
        if let Some(Value::Object(extra)) = details {
            for (key, value) in extra {
                body[key.as_str()] = value.clone();
            }
        }

        (status, Json(body)).into_response()
    }
}
