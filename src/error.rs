use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::gemini::GeminiError;

pub const NO_IMAGE_MESSAGE: &str = "No image provided";
pub const PROCESSING_FAILED_MESSAGE: &str = "Failed to process image";

/// Failures while reading settings at startup.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("API_KEY (or GEMINI_API_KEY) must be set")]
    MissingApiKey,

    #[error("{name} must be a positive integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
}

/// Everything that can go wrong while handling an upload.
///
/// Only `MissingImage` is reported to the caller as-is. Every other variant
/// collapses to a generic 500 and the cause is logged server-side.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("no image field in request")]
    MissingImage,

    #[error("multipart error: {0}")]
    Multipart(#[from] axum::extract::multipart::MultipartError),

    #[error("temp file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upstream error: {0}")]
    Upstream(#[from] GeminiError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::MissingImage => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn public_message(&self) -> &'static str {
        match self {
            AppError::MissingImage => NO_IMAGE_MESSAGE,
            _ => PROCESSING_FAILED_MESSAGE,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::MissingImage => tracing::warn!("Rejected request without image"),
            other => tracing::error!(error = %other, "Failed to process image"),
        }

        let body = ErrorBody {
            error: self.public_message(),
        };
        (self.status(), Json(body)).into_response()
    }
}
