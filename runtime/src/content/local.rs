//! On-disk blob store laid out as `blobs/<algorithm>/<hex>`.
//!
//! Writes land in `ingest/` first and are renamed into place, so a blob
//! path either holds complete, verified content or does not exist.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use imgpull_core::{BlobStore, Digest, PullError, Result};
use tracing::debug;

use super::verify_content;

pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Open (creating if needed) a blob store rooted at `root`.
    pub fn new(root: &Path) -> Result<Self> {
        for dir in ["blobs", "ingest"] {
            let path = root.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| {
                PullError::Io(format!(
                    "Failed to create blob store directory {}: {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the blob for `digest` lives once committed.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PullError::NotFound(format!("blob {}", digest)),
            _ => PullError::Io(format!("Failed to read blob {}: {}", path.display(), e)),
        })
    }

    async fn put(&self, digest: &Digest, data: Vec<u8>) -> Result<()> {
        verify_content(digest, &data)?;

        let target = self.blob_path(digest);
        if tokio::fs::try_exists(&target).await? {
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let ingest = self
            .root
            .join("ingest")
            .join(uuid::Uuid::new_v4().to_string());
        tokio::fs::write(&ingest, &data).await.map_err(|e| {
            PullError::Io(format!("Failed to write blob {}: {}", digest, e))
        })?;

        if let Err(e) = tokio::fs::rename(&ingest, &target).await {
            let _ = tokio::fs::remove_file(&ingest).await;
            // Another writer may have committed the same content first.
            if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                return Ok(());
            }
            return Err(PullError::Io(format!(
                "Failed to commit blob {}: {}",
                digest, e
            )));
        }

        debug!(digest = %digest, bytes = data.len(), "Committed blob");
        Ok(())
    }

    async fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.blob_path(digest)).await?)
    }
}
