//! Pull orchestration: resolve, fetch, record, and optionally unpack.

use std::sync::Arc;

use imgpull_core::{
    BlobStore, DiffService, Image, ImageStore, PullOptions, Resolver, Result, Snapshotter,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cancel::cancellable;
use crate::dispatch::Dispatcher;
use crate::metrics::PullMetrics;
use crate::unpack::SnapshotUnpacker;

/// The collaborators a pull runs against.
#[derive(Clone)]
pub struct PullServices {
    pub resolver: Arc<dyn Resolver>,
    pub content: Arc<dyn BlobStore>,
    pub images: Arc<dyn ImageStore>,
    pub snapshotter: Arc<dyn Snapshotter>,
    pub diff: Arc<dyn DiffService>,
}

/// Pulls images into the content and image stores.
pub struct ImagePuller {
    services: PullServices,
    metrics: PullMetrics,
}

impl ImagePuller {
    pub fn new(services: PullServices) -> Self {
        Self {
            services,
            metrics: PullMetrics::new(),
        }
    }

    /// Report into an existing metrics registry.
    pub fn with_metrics(mut self, metrics: PullMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &PullMetrics {
        &self.metrics
    }

    pub fn services(&self) -> &PullServices {
        &self.services
    }

    /// Pull `reference`.
    ///
    /// Content already in the blob store is not fetched again, and layers
    /// already unpacked are not applied again, so repeating a pull (or
    /// retrying a failed one) only does the missing work.
    pub async fn pull(
        &self,
        reference: &str,
        options: &PullOptions,
        cancel: &CancellationToken,
    ) -> Result<Image> {
        options.validate()?;
        info!(reference, unpack = options.unpack, "Pulling image");

        let resolver = &self.services.resolver;
        let resolved = cancellable(cancel, "resolve", resolver.resolve(reference)).await?;
        let fetcher = cancellable(
            cancel,
            "fetcher setup",
            resolver.fetcher(&resolved.name),
        )
        .await?;

        let summary = Dispatcher::new(self.services.content.clone())
            .with_options(options)
            .with_metrics(self.metrics.clone())
            .dispatch(&resolved.descriptor, fetcher, cancel)
            .await?;

        cancellable(
            cancel,
            "image record",
            self.services.images.put(&resolved.name, &resolved.descriptor),
        )
        .await?;
        let image = cancellable(
            cancel,
            "image lookup",
            self.services.images.get(&resolved.name),
        )
        .await?;

        if options.unpack {
            self.unpacker(options).unpack(&image, cancel).await?;
        }

        info!(
            name = %image.name,
            digest = %image.target.digest,
            fetched = summary.fetched,
            bytes = summary.bytes_fetched,
            "Pulled image"
        );
        Ok(image)
    }

    /// An unpacker over this puller's collaborators.
    pub fn unpacker(&self, options: &PullOptions) -> SnapshotUnpacker {
        SnapshotUnpacker::new(
            self.services.content.clone(),
            self.services.snapshotter.clone(),
            self.services.diff.clone(),
        )
        .with_platform(options.platform())
        .with_metrics(self.metrics.clone())
    }
}
