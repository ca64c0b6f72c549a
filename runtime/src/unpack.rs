//! Snapshot unpacking.
//!
//! Layers are applied bottom to top, each into a snapshot keyed by its
//! ChainID whose parent is the previous layer's ChainID. A layer whose
//! snapshot is already committed is skipped, which makes an interrupted
//! unpack resumable from the first missing layer.

use std::sync::Arc;

use imgpull_core::{
    chain_ids, BlobStore, DiffService, Digest, Image, Layer, Mount, Platform, PullError, Result,
    SnapshotKind, Snapshotter,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancel::cancellable;
use crate::layers::LayerResolver;
use crate::metrics::PullMetrics;

/// Counts from one unpack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnpackSummary {
    /// ChainID of the top layer; `None` for an image without layers
    pub chain_id: Option<Digest>,
    /// Layers applied and committed by this call
    pub applied: usize,
    /// Layers whose snapshot was already committed
    pub skipped: usize,
}

/// Applies an image's layers into committed snapshots.
pub struct SnapshotUnpacker {
    layers: LayerResolver,
    snapshotter: Arc<dyn Snapshotter>,
    diff: Arc<dyn DiffService>,
    metrics: Option<PullMetrics>,
}

impl SnapshotUnpacker {
    pub fn new(
        content: Arc<dyn BlobStore>,
        snapshotter: Arc<dyn Snapshotter>,
        diff: Arc<dyn DiffService>,
    ) -> Self {
        Self {
            layers: LayerResolver::new(content),
            snapshotter,
            diff,
            metrics: None,
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.layers = self.layers.with_platform(platform);
        self
    }

    pub fn with_metrics(mut self, metrics: PullMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Unpack `image` into snapshots.
    ///
    /// On failure, layers committed before the failing one stay committed
    /// and the failing layer's snapshot is removed. Errors other than
    /// cancellation are wrapped in `LayerApply` naming the layer.
    pub async fn unpack(&self, image: &Image, cancel: &CancellationToken) -> Result<UnpackSummary> {
        let layers =
            cancellable(cancel, "layer resolution", self.layers.resolve_layers(image)).await?;
        let diff_ids: Vec<Digest> = layers.iter().map(|l| l.diff.digest.clone()).collect();
        let chain = chain_ids(&diff_ids);

        info!(image = %image.name, layers = layers.len(), "Unpacking image");

        let mut summary = UnpackSummary::default();
        let mut parent: Option<&Digest> = None;
        for (index, (layer, chain_id)) in layers.iter().zip(chain.iter()).enumerate() {
            let applied = self
                .unpack_layer(index, layer, chain_id, parent, cancel)
                .await?;
            if applied {
                summary.applied += 1;
            } else {
                summary.skipped += 1;
            }
            if let Some(metrics) = &self.metrics {
                metrics.record_layer(applied);
            }
            parent = Some(chain_id);
        }
        summary.chain_id = chain.last().cloned();

        info!(
            image = %image.name,
            applied = summary.applied,
            skipped = summary.skipped,
            chain_id = ?summary.chain_id.as_ref().map(|c| c.to_string()),
            "Unpack complete"
        );
        Ok(summary)
    }

    /// Returns `false` when the layer's snapshot was already committed.
    async fn unpack_layer(
        &self,
        index: usize,
        layer: &Layer,
        chain_id: &Digest,
        parent: Option<&Digest>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let key = chain_id.to_string();

        match cancellable(cancel, "snapshot stat", self.snapshotter.stat(&key)).await {
            Ok(info) if info.kind == SnapshotKind::Committed => {
                debug!(index, chain_id = %key, "Layer already unpacked");
                return Ok(false);
            }
            // Any other state falls through to prepare, which reports the
            // key as taken.
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(layer_error(index, &key, e)),
        }

        // Prepare runs to completion so that a snapshot it creates is always
        // known to be ours and can be discarded.
        let parent_key = parent.map(|p| p.to_string());
        let mounts = self
            .snapshotter
            .prepare(&key, parent_key.as_deref())
            .await
            .map_err(|e| layer_error(index, &key, e))?;

        debug!(
            index,
            chain_id = %key,
            digest = %layer.blob.digest,
            "Applying layer"
        );
        if let Err(e) = self.apply_and_commit(layer, &key, &mounts, cancel).await {
            if let Err(settle) = self.diff.settle(&mounts).await {
                warn!(chain_id = %key, error = %settle, "Failed to wait for abandoned apply");
            }
            self.discard(&key).await;
            return Err(layer_error(index, &key, e));
        }
        Ok(true)
    }

    async fn apply_and_commit(
        &self,
        layer: &Layer,
        key: &str,
        mounts: &[Mount],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let applied =
            cancellable(cancel, "layer apply", self.diff.apply(mounts, &layer.blob)).await?;
        if applied.digest != layer.diff.digest {
            return Err(PullError::DigestMismatch {
                expected: layer.diff.digest.to_string(),
                actual: applied.digest.to_string(),
            });
        }

        // Not raced against cancellation: a commit either lands or fails.
        self.snapshotter.commit(key).await
    }

    /// Best-effort removal of a partially unpacked snapshot. Runs to
    /// completion even when the pull is canceled.
    async fn discard(&self, key: &str) {
        match self.snapshotter.remove(key).await {
            Ok(()) => debug!(chain_id = %key, "Removed incomplete snapshot"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(chain_id = %key, error = %e, "Failed to remove incomplete snapshot"),
        }
    }
}

fn layer_error(index: usize, key: &str, err: PullError) -> PullError {
    if err.is_canceled() {
        return err;
    }
    PullError::LayerApply {
        index,
        chain_id: key.to_string(),
        source: Box::new(err),
    }
}
