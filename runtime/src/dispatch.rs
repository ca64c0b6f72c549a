//! Content graph dispatch.
//!
//! Walks the graph rooted at a descriptor, fetching every blob that is not
//! already in the blob store and expanding indexes and manifests into their
//! children. A node's children are only discovered after the node itself is
//! stored, so by the time a manifest's layers are requested the manifest is
//! readable from the store.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use imgpull_core::{
    BlobReader, BlobStore, Descriptor, Fetcher, Index, Manifest, NodeKind, Platform, PullError,
    PullOptions, Result, RetryPolicy,
};
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancel::{cancellable, sleep};
use crate::metrics::PullMetrics;

const READ_CHUNK: usize = 64 * 1024;

/// Upper bound on the buffer reserved up front from a descriptor's size.
const MAX_PREALLOC: u64 = 16 * 1024 * 1024;

/// Counts from one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Blobs fetched and stored by this dispatch
    pub fetched: usize,
    /// Blobs already present in the store
    pub skipped: usize,
    /// Verified bytes fetched
    pub bytes_fetched: u64,
}

struct NodeOutcome {
    fetched: Option<u64>,
    children: Vec<Descriptor>,
}

/// Fetches a content graph into a blob store.
pub struct Dispatcher {
    store: Arc<dyn BlobStore>,
    limiter: Semaphore,
    retry: RetryPolicy,
    platform: Option<Platform>,
    metrics: Option<PullMetrics>,
}

impl Dispatcher {
    /// A dispatcher with default limits that follows every index entry.
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        let defaults = PullOptions::default();
        Self {
            store,
            limiter: Semaphore::new(defaults.max_concurrent_fetches),
            retry: defaults.retry,
            platform: None,
            metrics: None,
        }
    }

    /// Apply concurrency, retry and platform settings from pull options.
    /// Index entries for other platforms are not followed.
    pub fn with_options(mut self, options: &PullOptions) -> Self {
        self.limiter = Semaphore::new(options.max_concurrent_fetches.max(1));
        self.retry = options.retry.clone();
        self.platform = Some(options.platform());
        self
    }

    pub fn with_metrics(mut self, metrics: PullMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Ensure every blob reachable from `root` is in the blob store.
    ///
    /// Each distinct digest is handled at most once per dispatch. The first
    /// failure aborts the walk; blobs stored before it stay stored.
    pub async fn dispatch(
        &self,
        root: &Descriptor,
        fetcher: Arc<dyn Fetcher>,
        cancel: &CancellationToken,
    ) -> Result<DispatchSummary> {
        info!(
            digest = %root.digest,
            media_type = %root.media_type,
            "Dispatching content graph"
        );

        let fetcher = fetcher.as_ref();
        let mut summary = DispatchSummary::default();
        let mut seen = HashSet::new();
        let mut pending = FuturesUnordered::new();

        seen.insert(root.digest.clone());
        pending.push(self.handle(root.clone(), fetcher, cancel));

        while let Some(result) = pending.next().await {
            let outcome = result?;
            match outcome.fetched {
                Some(bytes) => {
                    summary.fetched += 1;
                    summary.bytes_fetched += bytes;
                }
                None => summary.skipped += 1,
            }
            for child in outcome.children {
                if seen.insert(child.digest.clone()) {
                    pending.push(self.handle(child, fetcher, cancel));
                }
            }
        }

        info!(
            digest = %root.digest,
            fetched = summary.fetched,
            skipped = summary.skipped,
            bytes = summary.bytes_fetched,
            "Dispatch complete"
        );
        Ok(summary)
    }

    async fn handle(
        &self,
        desc: Descriptor,
        fetcher: &dyn Fetcher,
        cancel: &CancellationToken,
    ) -> Result<NodeOutcome> {
        let fetched = self.fetch_if_absent(&desc, fetcher, cancel).await?;
        let children = self.children(&desc, cancel).await?;
        Ok(NodeOutcome { fetched, children })
    }

    /// Returns the verified byte count when the blob was fetched, `None`
    /// when the store already had it.
    async fn fetch_if_absent(
        &self,
        desc: &Descriptor,
        fetcher: &dyn Fetcher,
        cancel: &CancellationToken,
    ) -> Result<Option<u64>> {
        if cancellable(cancel, "blob lookup", self.store.exists(&desc.digest)).await? {
            debug!(digest = %desc.digest, "Blob already present");
            if let Some(metrics) = &self.metrics {
                metrics.record_skip();
            }
            return Ok(None);
        }

        let _permit = cancellable(cancel, "fetch slot", async {
            self.limiter
                .acquire()
                .await
                .map_err(|_| PullError::Io("fetch limiter closed".to_string()))
        })
        .await?;

        let mut attempt = 1;
        loop {
            match self.fetch_once(desc, fetcher, cancel).await {
                Ok(bytes) => {
                    debug!(digest = %desc.digest, bytes, "Fetched blob");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_fetch(bytes);
                    }
                    return Ok(Some(bytes));
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        digest = %desc.digest,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Blob fetch failed, retrying"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_retry();
                    }
                    sleep(cancel, "fetch backoff", delay).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(
        &self,
        desc: &Descriptor,
        fetcher: &dyn Fetcher,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut reader = cancellable(cancel, "blob fetch", fetcher.fetch(desc)).await?;
        let data = cancellable(cancel, "blob read", read_verified(&mut reader, desc)).await?;
        let bytes = data.len() as u64;
        cancellable(cancel, "blob store", self.store.put(&desc.digest, data)).await?;
        Ok(bytes)
    }

    async fn children(
        &self,
        desc: &Descriptor,
        cancel: &CancellationToken,
    ) -> Result<Vec<Descriptor>> {
        let kind = desc.kind();
        if !kind.has_children() {
            return Ok(Vec::new());
        }

        let data = cancellable(cancel, "blob read", self.store.get(&desc.digest)).await?;
        match kind {
            NodeKind::Manifest => {
                let manifest: Manifest = serde_json::from_slice(&data).map_err(|e| {
                    PullError::Serialization(format!("manifest {}: {}", desc.digest, e))
                })?;
                let mut children = Vec::with_capacity(manifest.layers.len() + 1);
                children.push(manifest.config);
                children.extend(manifest.layers);
                Ok(children)
            }
            NodeKind::Index => {
                let index: Index = serde_json::from_slice(&data).map_err(|e| {
                    PullError::Serialization(format!("index {}: {}", desc.digest, e))
                })?;
                Ok(index
                    .manifests
                    .into_iter()
                    .filter(|child| self.follows(child))
                    .collect())
            }
            _ => Ok(Vec::new()),
        }
    }

    fn follows(&self, child: &Descriptor) -> bool {
        match (&self.platform, &child.platform) {
            (Some(wanted), Some(platform)) => wanted.matches(platform),
            _ => true,
        }
    }
}

/// Read a blob stream to the end, checking size and digest against `desc`.
async fn read_verified(reader: &mut BlobReader, desc: &Descriptor) -> Result<Vec<u8>> {
    let expected_size = desc.expected_size();
    let mut verifier = desc.digest.verifier();
    let mut data = Vec::with_capacity(expected_size.unwrap_or(0).min(MAX_PREALLOC) as usize);
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        verifier.update(&buf[..n]);
        data.extend_from_slice(&buf[..n]);

        if let Some(expected) = expected_size {
            if verifier.written() > expected {
                return Err(PullError::SizeMismatch {
                    digest: desc.digest.to_string(),
                    expected,
                    actual: verifier.written(),
                });
            }
        }
    }

    verifier.verify(expected_size)?;
    Ok(data)
}
