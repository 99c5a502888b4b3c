use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use parley_shared::media::{content_type_for, MediaPayload};

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Media too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Empty media payload")]
    Empty,

    #[error("Media not found: {0}")]
    NotFound(String),

    #[error("Invalid media name: {0}")]
    InvalidName(String),

    #[error("Object store unavailable: {0}")]
    Unavailable(String),
}

/// External object store: accepts an upload and returns a retrievable URL.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, media: MediaPayload) -> Result<String, MediaError>;
}

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, MediaError> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(base)
        .unwrap_or(target)
        .components()
    {
        match component {
            std::path::Component::Normal(c) => resolved.push(c),
            std::path::Component::ParentDir => {
                return Err(MediaError::InvalidName("path traversal".to_string()));
            }
            _ => {}
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(MediaError::InvalidName("path traversal".to_string()));
    }
    Ok(resolved)
}

/// Object store writing each upload to `<base>/<uuid>.<ext>` and serving it
/// back under `<public_base_url>/media/<uuid>.<ext>`.
#[derive(Debug, Clone)]
pub struct DiskMediaStore {
    base_path: PathBuf,
    public_base_url: String,
    max_size: usize,
}

impl DiskMediaStore {
    pub async fn new(
        base_path: PathBuf,
        public_base_url: impl Into<String>,
        max_size: usize,
    ) -> Result<Self, MediaError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            MediaError::Unavailable(format!(
                "Failed to create media directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Media store initialized");

        Ok(Self {
            base_path,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            max_size,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn url_for(&self, file_name: &str) -> String {
        format!("{}/media/{}", self.public_base_url, file_name)
    }

    /// Read a stored object.  Returns its bytes and content type.
    pub async fn get(&self, file_name: &str) -> Result<(Vec<u8>, &'static str), MediaError> {
        let path = self.safe_path(file_name)?;

        if !path.exists() {
            return Err(MediaError::NotFound(file_name.to_string()));
        }

        let data = fs::read(&path)
            .await
            .map_err(|e| MediaError::Unavailable(format!("Failed to read {file_name}: {e}")))?;

        let extension = file_name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
        debug!(file = file_name, size = data.len(), "Served media");
        Ok((data, content_type_for(extension)))
    }

    /// Stored names are `<uuid>.<ext>`; anything else is rejected before
    /// touching the filesystem.
    fn safe_path(&self, file_name: &str) -> Result<PathBuf, MediaError> {
        let (stem, ext) = file_name
            .split_once('.')
            .ok_or_else(|| MediaError::InvalidName(file_name.to_string()))?;
        if Uuid::parse_str(stem).is_err()
            || ext.is_empty()
            || !ext.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(MediaError::InvalidName(file_name.to_string()));
        }
        ensure_within(&self.base_path, &self.base_path.join(file_name))
    }
}

#[async_trait]
impl ObjectStore for DiskMediaStore {
    async fn upload(&self, media: MediaPayload) -> Result<String, MediaError> {
        if media.is_empty() {
            return Err(MediaError::Empty);
        }
        if media.len() > self.max_size {
            return Err(MediaError::TooLarge {
                size: media.len(),
                max: self.max_size,
            });
        }

        let file_name = format!("{}.{}", Uuid::new_v4(), media.extension());
        let path = self.safe_path(&file_name)?;

        fs::write(&path, &media.bytes).await.map_err(|e| {
            MediaError::Unavailable(format!("Failed to write {file_name}: {e}"))
        })?;

        debug!(file = %file_name, size = media.len(), "Stored media");
        Ok(self.url_for(&file_name))
    }
}
