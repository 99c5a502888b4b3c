use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use parley_shared::protocol::ErrorBody;
use parley_store::StoreError;

use crate::delivery::DeliveryError;
use crate::media_store::MediaError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unknown user")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Media upload failed: {0}")]
    MediaUpload(String),

    #[error("Storage unavailable: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<DeliveryError> for ServerError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::Validation(msg) => ServerError::BadRequest(msg),
            DeliveryError::MediaUpload(e) => ServerError::MediaUpload(e.to_string()),
            DeliveryError::Persistence(e) => e.into(),
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ServerError::NotFound("record".into()),
            other => ServerError::Persistence(other.to_string()),
        }
    }
}

/// Media read-back for `/media/{file}`.  Upload failures arrive wrapped in
/// [`DeliveryError::MediaUpload`] instead.
impl From<MediaError> for ServerError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::NotFound(name) | MediaError::InvalidName(name) => {
                ServerError::NotFound(name)
            }
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::MediaUpload(_) => {
                (StatusCode::BAD_GATEWAY, "Media upload failed".to_string())
            }
            ServerError::Persistence(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "Storage unavailable".to_string())
            }
            ServerError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        (status, axum::Json(ErrorBody { error: message })).into_response()
    }
}
