//! Pull pipeline metrics backed by a Prometheus registry.

use std::sync::Arc;

use imgpull_core::error::{PullError, Result};
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

/// Shared pull counters. Cloning shares the underlying registry.
#[derive(Clone)]
pub struct PullMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    blobs_fetched: IntCounter,
    blobs_skipped: IntCounter,
    bytes_fetched: IntCounter,
    fetch_retries: IntCounter,
    layers_applied: IntCounter,
    layers_skipped: IntCounter,
}

impl std::fmt::Debug for PullMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullMetrics")
            .field("blobs_fetched", &self.blobs_fetched())
            .field("layers_applied", &self.layers_applied())
            .finish()
    }
}

impl Default for PullMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PullMetrics {
    /// Create a new metrics instance with a fresh Prometheus registry.
    pub fn new() -> Self {
        let registry = Registry::new();

        let blobs_fetched = counter(
            &registry,
            "imgpull_blobs_fetched_total",
            "Blobs fetched and stored",
        );
        let blobs_skipped = counter(
            &registry,
            "imgpull_blobs_skipped_total",
            "Blobs already present in the blob store",
        );
        let bytes_fetched = counter(
            &registry,
            "imgpull_bytes_fetched_total",
            "Verified bytes fetched",
        );
        let fetch_retries = counter(
            &registry,
            "imgpull_fetch_retries_total",
            "Blob fetch attempts retried after a transient failure",
        );
        let layers_applied = counter(
            &registry,
            "imgpull_layers_applied_total",
            "Layers applied and committed as snapshots",
        );
        let layers_skipped = counter(
            &registry,
            "imgpull_layers_skipped_total",
            "Layers whose snapshot was already committed",
        );

        Self {
            inner: Arc::new(Inner {
                registry,
                blobs_fetched,
                blobs_skipped,
                bytes_fetched,
                fetch_retries,
                layers_applied,
                layers_skipped,
            }),
        }
    }

    pub(crate) fn record_fetch(&self, bytes: u64) {
        self.inner.blobs_fetched.inc();
        self.inner.bytes_fetched.inc_by(bytes);
    }

    pub(crate) fn record_skip(&self) {
        self.inner.blobs_skipped.inc();
    }

    pub(crate) fn record_retry(&self) {
        self.inner.fetch_retries.inc();
    }

    pub(crate) fn record_layer(&self, applied: bool) {
        if applied {
            self.inner.layers_applied.inc();
        } else {
            self.inner.layers_skipped.inc();
        }
    }

    pub fn blobs_fetched(&self) -> u64 {
        self.inner.blobs_fetched.get()
    }

    pub fn blobs_skipped(&self) -> u64 {
        self.inner.blobs_skipped.get()
    }

    pub fn bytes_fetched(&self) -> u64 {
        self.inner.bytes_fetched.get()
    }

    pub fn fetch_retries(&self) -> u64 {
        self.inner.fetch_retries.get()
    }

    pub fn layers_applied(&self) -> u64 {
        self.inner.layers_applied.get()
    }

    pub fn layers_skipped(&self) -> u64 {
        self.inner.layers_skipped.get()
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn gather_text(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.inner.registry.gather(), &mut buf)
            .map_err(|e| PullError::Serialization(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buf)
            .map_err(|e| PullError::Serialization(format!("Metrics are not UTF-8: {}", e)))
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric can be created");
    registry
        .register(Box::new(counter.clone()))
        .expect("metric can be registered");
    counter
}
