pub mod configurations;
pub mod export;
pub mod monitor;
pub mod webhooks;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use trimsync_core::SyncError;

/// Standard API error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Convert engine and anyhow errors to HTTP responses
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<SyncError>() {
            Some(SyncError::ConfigNotFound(_))
            | Some(SyncError::ExportNotFound(_))
            | Some(SyncError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(SyncError::Validation(_)) => StatusCode::BAD_REQUEST,
            Some(SyncError::Auth(_)) => StatusCode::UNAUTHORIZED,
            Some(SyncError::RateLimit { .. }) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ErrorResponse {
            error: self.0.to_string(),
        });
        (status, body).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
