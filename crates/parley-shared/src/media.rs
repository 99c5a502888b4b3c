//! Media payloads travel inside JSON as `data:` URLs and are handed to the
//! object store as raw bytes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::ProtocolError;

/// A decoded media blob with its declared content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPayload {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl MediaPayload {
    pub fn new(content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            bytes,
        }
    }

    /// Decode a `data:image/<kind>;base64,<payload>` URL.
    ///
    /// Only `image/*` types are accepted.
    pub fn from_data_url(url: &str) -> Result<Self, ProtocolError> {
        let rest = url
            .trim()
            .strip_prefix("data:")
            .ok_or_else(|| ProtocolError::MalformedDataUrl("missing data: prefix".into()))?;

        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| ProtocolError::MalformedDataUrl("missing ',' separator".into()))?;

        let content_type = header
            .strip_suffix(";base64")
            .ok_or_else(|| ProtocolError::MalformedDataUrl("payload is not base64".into()))?
            .to_ascii_lowercase();

        if !content_type.starts_with("image/") || content_type.len() <= "image/".len() {
            return Err(ProtocolError::UnsupportedMediaType(content_type));
        }

        let bytes = STANDARD.decode(payload)?;
        if bytes.is_empty() {
            return Err(ProtocolError::MalformedDataUrl("empty payload".into()));
        }

        Ok(Self {
            content_type,
            bytes,
        })
    }

    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.content_type,
            STANDARD.encode(&self.bytes)
        )
    }

    /// File extension used by the object store.
    pub fn extension(&self) -> &'static str {
        extension_for(&self.content_type)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

pub fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "bin",
    }
}

pub fn content_type_for(extension: &str) -> &'static str {
    match extension {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_png_data_url() {
        let payload = MediaPayload::from_data_url("data:image/png;base64,iVBORw0K").unwrap();
        assert_eq!(payload.content_type, "image/png");
        assert_eq!(payload.extension(), "png");
        assert!(!payload.is_empty());
    }

    #[test]
    fn test_reject_non_image() {
        let err = MediaPayload::from_data_url("data:text/html;base64,PGI+").unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedMediaType(_)));
    }

    #[test]
    fn test_reject_plain_url() {
        assert!(MediaPayload::from_data_url("https://example.com/cat.png").is_err());
        assert!(MediaPayload::from_data_url("data:image/png,rawbytes").is_err());
    }

    #[test]
    fn test_reject_empty_payload() {
        assert!(MediaPayload::from_data_url("data:image/png;base64,").is_err());
    }

    #[test]
    fn test_encode_matches_decode() {
        let original = MediaPayload::new("image/jpeg", vec![0xFF, 0xD8, 0xFF]);
        let decoded = MediaPayload::from_data_url(&original.to_data_url()).unwrap();
        assert_eq!(decoded, original);
    }
}
