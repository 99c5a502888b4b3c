use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed data URL: {0}")]
    MalformedDataUrl(String),

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}
