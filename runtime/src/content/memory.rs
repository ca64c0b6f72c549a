use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use imgpull_core::{BlobStore, Digest, PullError, Result};

use super::verify_content;

/// Blob store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<Digest, Arc<[u8]>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.blobs
            .get(digest)
            .map(|blob| blob.to_vec())
            .ok_or_else(|| PullError::NotFound(format!("blob {}", digest)))
    }

    async fn put(&self, digest: &Digest, data: Vec<u8>) -> Result<()> {
        verify_content(digest, &data)?;
        self.blobs
            .entry(digest.clone())
            .or_insert_with(|| Arc::from(data));
        Ok(())
    }

    async fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.blobs.contains_key(digest))
    }
}
