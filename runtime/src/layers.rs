//! Layer resolution: pairs each manifest layer with its diff ID.

use std::sync::Arc;

use imgpull_core::{
    uncompressed_media_type, BlobStore, Descriptor, Digest, Image, ImageConfig, Index, Layer,
    Manifest, NodeKind, Platform, PullError, Result,
};
use serde::de::DeserializeOwned;
use tracing::debug;

/// Nested indexes deeper than this are rejected.
const MAX_INDEX_DEPTH: usize = 4;

/// Reads an image's manifest and config from the blob store and derives
/// its ordered layer list.
pub struct LayerResolver {
    store: Arc<dyn BlobStore>,
    platform: Platform,
}

impl LayerResolver {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            platform: Platform::host(),
        }
    }

    /// Platform used to pick a manifest when the image is an index.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Resolve the platform manifest for `image`.
    pub async fn manifest(&self, image: &Image) -> Result<Manifest> {
        let mut target = image.target.clone();
        for _ in 0..=MAX_INDEX_DEPTH {
            match target.kind() {
                NodeKind::Manifest => return self.read_json(&target, "manifest").await,
                NodeKind::Index => {
                    let index: Index = self.read_json(&target, "index").await?;
                    target = self.select(&index, &target)?;
                }
                _ => {
                    return Err(PullError::FailedPrecondition(format!(
                        "image {} has unsupported media type {}",
                        image.name, target.media_type
                    )))
                }
            }
        }
        Err(PullError::FailedPrecondition(format!(
            "image {} nests indexes deeper than {}",
            image.name, MAX_INDEX_DEPTH
        )))
    }

    /// The image's diff IDs in application order.
    pub async fn diff_ids(&self, image: &Image) -> Result<Vec<Digest>> {
        let manifest = self.manifest(image).await?;
        self.config_diff_ids(&manifest).await
    }

    /// Ordered layers of `image`, base first.
    ///
    /// Fails with `LayerMismatch` when the config lists a different number
    /// of diff IDs than the manifest has layers.
    pub async fn resolve_layers(&self, image: &Image) -> Result<Vec<Layer>> {
        let manifest = self.manifest(image).await?;
        let diff_ids = self.config_diff_ids(&manifest).await?;

        if diff_ids.len() != manifest.layers.len() {
            return Err(PullError::LayerMismatch {
                manifest_layers: manifest.layers.len(),
                diff_ids: diff_ids.len(),
            });
        }

        let layers: Vec<Layer> = manifest
            .layers
            .into_iter()
            .zip(diff_ids)
            .map(|(blob, diff_id)| Layer {
                diff: Descriptor::new(uncompressed_media_type(&blob.media_type), diff_id, -1),
                blob,
            })
            .collect();

        debug!(image = %image.name, layers = layers.len(), "Resolved layers");
        Ok(layers)
    }

    async fn config_diff_ids(&self, manifest: &Manifest) -> Result<Vec<Digest>> {
        let config: ImageConfig = self.read_json(&manifest.config, "config").await?;
        Ok(config.rootfs.diff_ids)
    }

    fn select(&self, index: &Index, desc: &Descriptor) -> Result<Descriptor> {
        let matching = index.manifests.iter().find(|m| {
            m.platform
                .as_ref()
                .map(|p| self.platform.matches(p))
                .unwrap_or(false)
        });
        let fallback = || index.manifests.iter().find(|m| m.platform.is_none());

        matching
            .or_else(fallback)
            .cloned()
            .ok_or_else(|| {
                PullError::NotFound(format!(
                    "no manifest for platform {} in index {}",
                    self.platform, desc.digest
                ))
            })
    }

    async fn read_json<T: DeserializeOwned>(&self, desc: &Descriptor, what: &str) -> Result<T> {
        let data = self.store.get(&desc.digest).await?;
        serde_json::from_slice(&data)
            .map_err(|e| PullError::Serialization(format!("{} {}: {}", what, desc.digest, e)))
    }
}
