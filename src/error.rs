//! Error handling

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{error, info};

/// Errors raised while building, publishing or serving a character.
#[derive(Debug, thiserror::Error)]
pub enum MobsmithError {
    /// Missing or invalid credentials and settings, raised before any network call.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// The vision model could not describe the photo.
    #[error("Description failed: {0}")]
    DescriptionFailed(String),
    /// The image generation service failed or returned something unusable.
    #[error("Image generation failed: {0}")]
    GenerationFailed(String),
    /// The object store rejected the upload.
    #[error("Publishing failed: {0}")]
    PublishFailed(String),
    /// The link could not be turned into a scan code.
    #[error("Scan code encoding failed: {0}")]
    EncodingFailed(String),
    /// The frame could not be used. Never fatal, compositing is skipped.
    #[error("Frame unavailable: {0}")]
    FrameUnavailable(String),
    /// When you didn't do the right thing
    #[error("Bad request: {0}")]
    BadRequest(String),
    /// Upload over the body limit
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),
    /// When a requested blob is not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// Bad or expired blob signature
    #[error("Forbidden")]
    Forbidden,
    /// When an internal server error occurs
    #[error("Internal error: {0}")]
    InternalServerError(String),
}

impl From<std::io::Error> for MobsmithError {
    fn from(err: std::io::Error) -> Self {
        MobsmithError::InternalServerError(err.to_string())
    }
}

impl From<axum::http::Error> for MobsmithError {
    fn from(err: axum::http::Error) -> Self {
        MobsmithError::InternalServerError(err.to_string())
    }
}

impl From<url::ParseError> for MobsmithError {
    fn from(err: url::ParseError) -> Self {
        MobsmithError::Configuration(format!("invalid URL: {err}"))
    }
}

impl MobsmithError {
    /// HTTP status used when the error reaches the web layer.
    pub fn status_code(&self) -> StatusCode {
        match self {
            MobsmithError::Configuration(_) | MobsmithError::InternalServerError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            MobsmithError::DescriptionFailed(_)
            | MobsmithError::GenerationFailed(_)
            | MobsmithError::PublishFailed(_) => StatusCode::BAD_GATEWAY,
            MobsmithError::EncodingFailed(_) | MobsmithError::FrameUnavailable(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            MobsmithError::BadRequest(_) => StatusCode::BAD_REQUEST,
            MobsmithError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            MobsmithError::NotFound(_) => StatusCode::NOT_FOUND,
            MobsmithError::Forbidden => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for MobsmithError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("{}", self);
        } else {
            info!("{}", self);
        }
        // configuration details stay in the log
        let message = match &self {
            MobsmithError::Configuration(_) | MobsmithError::InternalServerError(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
