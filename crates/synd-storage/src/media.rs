//! Hash-addressed media uploads.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use synd_core::MediaRef;
use thiserror::Error;
use tokio::fs;
use tracing::{info_span, warn, Instrument};

use crate::write_atomically;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("refusing to upload an empty file")]
    Empty,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Turns raw bytes into a stable [`MediaRef`].
#[async_trait]
pub trait MediaUploader: Send + Sync {
    async fn upload(&self, bytes: &[u8], extension: &str) -> Result<MediaRef, UploadError>;
}

#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub extension: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub struct UploadOutcome {
    pub name: String,
    pub result: Result<MediaRef, UploadError>,
}

/// Uploads every file in order. A failed file is reported in its outcome and the
/// rest of the batch still goes through.
pub async fn upload_batch(uploader: &dyn MediaUploader, files: Vec<UploadFile>) -> Vec<UploadOutcome> {
    let mut outcomes = Vec::with_capacity(files.len());
    for file in files {
        let result = uploader
            .upload(&file.bytes, &file.extension)
            .instrument(info_span!("media_upload", name = %file.name))
            .await;
        if let Err(err) = &result {
            warn!(name = %file.name, error = %err, "media upload failed");
        }
        outcomes.push(UploadOutcome {
            name: file.name,
            result,
        });
    }
    outcomes
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable media store on local disk, served from `public_base_url`.
#[derive(Debug, Clone)]
pub struct ArtifactMediaStore {
    root: PathBuf,
    public_base_url: String,
}

impl ArtifactMediaStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(
        &self,
        uploaded_at: DateTime<Utc>,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = uploaded_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp).join(format!("{content_hash}.{ext}"))
    }

    pub fn media_ref_for(&self, relative_path: &Path) -> MediaRef {
        let rel = relative_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        MediaRef::new(format!("{}/{}", self.public_base_url.trim_end_matches('/'), rel))
    }

    /// Stores bytes once per content hash; a repeat upload reuses the existing file.
    pub async fn store_bytes(
        &self,
        uploaded_at: DateTime<Utc>,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(uploaded_at, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating media directory {}", parent.display()))?;
        }

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking media path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomically(&absolute_path, bytes)
                .await
                .with_context(|| format!("writing media file {}", absolute_path.display()))?;
        }

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

#[async_trait]
impl MediaUploader for ArtifactMediaStore {
    async fn upload(&self, bytes: &[u8], extension: &str) -> Result<MediaRef, UploadError> {
        if bytes.is_empty() {
            return Err(UploadError::Empty);
        }
        let stored = self.store_bytes(Utc::now(), extension, bytes).await?;
        Ok(self.media_ref_for(&stored.relative_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn media_hashing_is_stable() {
        let hash = ArtifactMediaStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_bytes_share_one_file() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactMediaStore::new(dir.path(), "https://cdn.example/media/");
        let uploaded_at = DateTime::parse_from_rfc3339("2026-03-02T08:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_bytes(uploaded_at, ".jpg", b"jpeg-bytes")
            .await
            .expect("first store");
        let second = store
            .store_bytes(uploaded_at, "jpg", b"jpeg-bytes")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
        assert_eq!(
            store.media_ref_for(&first.relative_path).as_str(),
            format!("https://cdn.example/media/20260302/{}.jpg", first.content_hash)
        );
    }

    #[tokio::test]
    async fn batch_upload_survives_a_bad_file() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactMediaStore::new(dir.path(), "file://media");
        let files = vec![
            UploadFile {
                name: "front.jpg".into(),
                extension: "jpg".into(),
                bytes: b"front".to_vec(),
            },
            UploadFile {
                name: "broken.jpg".into(),
                extension: "jpg".into(),
                bytes: Vec::new(),
            },
            UploadFile {
                name: "garden.png".into(),
                extension: "png".into(),
                bytes: b"garden".to_vec(),
            },
        ];

        let outcomes = upload_batch(&store, files).await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].result.is_ok());
        assert!(matches!(outcomes[1].result, Err(UploadError::Empty)));
        let garden = outcomes[2].result.as_ref().expect("garden uploaded");
        assert!(garden.as_str().ends_with(".png"));
    }
}
