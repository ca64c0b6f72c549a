use std::collections::BTreeMap;

use async_trait::async_trait;
use imgpull_core::{Descriptor, Image, ImageStore, PullError, Result};
use parking_lot::RwLock;

/// Image store held in memory.
#[derive(Debug, Default)]
pub struct MemoryImageStore {
    images: RwLock<BTreeMap<String, Descriptor>>,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn put(&self, name: &str, target: &Descriptor) -> Result<()> {
        self.images.write().insert(name.to_string(), target.clone());
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Image> {
        self.images
            .read()
            .get(name)
            .map(|target| Image {
                name: name.to_string(),
                target: target.clone(),
            })
            .ok_or_else(|| PullError::NotFound(format!("image {}", name)))
    }

    async fn list(&self) -> Result<Vec<Image>> {
        Ok(self
            .images
            .read()
            .iter()
            .map(|(name, target)| Image {
                name: name.clone(),
                target: target.clone(),
            })
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.images
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| PullError::NotFound(format!("image {}", name)))
    }
}
