use attendance_core::api::CheckResponse;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("No image uploaded")]
    MissingImage,
    #[error("No period given")]
    MissingPeriod,
    #[error("Malformed request: {0}")]
    MalformedPayload(String),
    #[error("Upload too large")]
    PayloadTooLarge,
    #[error("Database unavailable")]
    StoreUnavailable,
    #[error("Database error")]
    Store(String),
    #[error("Failed to store image")]
    Upload(#[from] std::io::Error),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) => AppError::StoreUnavailable,
            StoreError::Query(reason) => AppError::Store(reason),
        }
    }
}

impl AppError {
    /// Stable code for logs.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::MissingImage => "MISSING_IMAGE",
            AppError::MissingPeriod => "MISSING_PERIOD",
            AppError::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            AppError::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            AppError::StoreUnavailable => "PERSISTENCE_UNAVAILABLE",
            AppError::Store(_) | AppError::Upload(_) => "PERSISTENCE_WRITE_FAILED",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::MissingImage | AppError::MissingPeriod | AppError::MalformedPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Store(_) | AppError::Upload(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        match &self {
            AppError::Store(reason) => tracing::error!(code, %reason, "check-in write failed"),
            AppError::Upload(err) => tracing::error!(code, error = %err, "snapshot write failed"),
            AppError::StoreUnavailable => tracing::warn!(code, "check-in refused: database unavailable"),
            other => tracing::debug!(code, error = %other, "rejected check-in request"),
        }

        let body = CheckResponse {
            success: false,
            message: self.to_string(),
            data: None,
        };
        (status, Json(body)).into_response()
    }
}
