use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

/// Crate-wide error taxonomy, mapped 1:1 to the wire codes in the error
/// handling design. `Internal` always logs with a correlation id and never
/// leaks its message to the client.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("rate limited")]
    RateLimited,
    #[error("provider error: {0}")]
    ProviderError(String),
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::ProviderError(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message shown to the caller. Internal errors never surface their
    /// real message; everything else is already caller-safe.
    fn public_detail(&self, correlation_id: Uuid) -> String {
        match self {
            AppError::BadRequest(m) => m.clone(),
            AppError::Unauthorized => "authentication failed".to_string(),
            AppError::Forbidden => "access denied".to_string(),
            AppError::NotFound => "not found".to_string(),
            AppError::Conflict(m) => m.clone(),
            AppError::RateLimited => "rate limit exceeded".to_string(),
            AppError::ProviderError(_) => "upstream provider error".to_string(),
            AppError::Internal(_) => format!("internal error (ref: {correlation_id})"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let correlation_id = Uuid::new_v4();
        let status = self.status();
        if matches!(self, AppError::Internal(_)) {
            tracing::error!(%correlation_id, error = %self, "internal error");
        } else {
            tracing::warn!(%correlation_id, status = %status, error = %self, "request failed");
        }
        let body = ErrorBody {
            detail: self.public_detail(correlation_id),
        };
        (status, Json(body)).into_response()
    }
}

/// Errors surfaced by the persistence layer; translated to [`AppError`] at
/// the engine boundary so store implementations stay storage-agnostic.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => AppError::NotFound,
            StoreError::Conflict(m) => AppError::Conflict(m),
            StoreError::Backend(e) => AppError::Internal(e),
        }
    }
}
