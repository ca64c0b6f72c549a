//! Root filesystem provisioning on top of an unpacked image.

use std::sync::Arc;

use imgpull_core::{chain_id, BlobStore, Image, Mount, Platform, Result, Snapshotter};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cancel::cancellable;
use crate::layers::LayerResolver;

/// Whether a provisioned root filesystem can be written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RootfsMode {
    #[default]
    Writable,
    ReadOnly,
}

/// Allocates snapshots whose parent is an image's top ChainID.
///
/// The image must already be unpacked; otherwise the snapshotter reports
/// the parent as missing.
pub struct RootfsProvisioner {
    layers: LayerResolver,
    snapshotter: Arc<dyn Snapshotter>,
}

impl RootfsProvisioner {
    pub fn new(content: Arc<dyn BlobStore>, snapshotter: Arc<dyn Snapshotter>) -> Self {
        Self {
            layers: LayerResolver::new(content),
            snapshotter,
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.layers = self.layers.with_platform(platform);
        self
    }

    /// Create snapshot `id` over `image`.
    pub async fn create(
        &self,
        id: &str,
        image: &Image,
        mode: RootfsMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<Mount>> {
        let diff_ids = cancellable(cancel, "layer resolution", self.layers.diff_ids(image)).await?;
        let parent = chain_id(&diff_ids).map(|c| c.to_string());

        let mounts = match mode {
            RootfsMode::Writable => {
                cancellable(
                    cancel,
                    "snapshot prepare",
                    self.snapshotter.prepare(id, parent.as_deref()),
                )
                .await?
            }
            RootfsMode::ReadOnly => {
                cancellable(
                    cancel,
                    "snapshot view",
                    self.snapshotter.view(id, parent.as_deref()),
                )
                .await?
            }
        };

        info!(id, image = %image.name, mode = ?mode, parent = ?parent, "Provisioned rootfs");
        Ok(mounts)
    }

    /// Mounts of an already provisioned snapshot.
    pub async fn existing(&self, id: &str, cancel: &CancellationToken) -> Result<Vec<Mount>> {
        cancellable(cancel, "snapshot mounts", self.snapshotter.mounts(id)).await
    }
}
