//! Test doubles shared by unit tests.

use std::collections::HashMap;
use std::io::Cursor;

use async_trait::async_trait;
use imgpull_core::{
    media_types, BlobReader, BlobStore, Descriptor, DiffService, Digest, Fetcher, ImageConfig,
    Manifest, Mount, PullError, Result, RootFs, SnapshotInfo, SnapshotKind, Snapshotter,
};
use parking_lot::Mutex;

/// A single-platform image whose layer blobs are uncompressed, so each
/// layer's blob digest is also its diff ID.
pub(crate) struct ImageFixture {
    pub manifest: Descriptor,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    pub diff_ids: Vec<Digest>,
    blobs: Vec<(Digest, Vec<u8>)>,
}

impl ImageFixture {
    pub fn new(layer_contents: &[&str]) -> Self {
        let mut blobs = Vec::new();
        let mut layers = Vec::new();
        for content in layer_contents {
            let desc = Descriptor::for_bytes(media_types::OCI_LAYER, content.as_bytes());
            blobs.push((desc.digest.clone(), content.as_bytes().to_vec()));
            layers.push(desc);
        }
        let diff_ids: Vec<Digest> = layers.iter().map(|l| l.digest.clone()).collect();
        Self::assemble(layers, diff_ids, blobs)
    }

    /// Like [`ImageFixture::new`] but with a config listing `diff_ids`
    /// verbatim.
    pub fn with_diff_ids(layer_contents: &[&str], diff_ids: Vec<Digest>) -> Self {
        let base = Self::new(layer_contents);
        let blobs = base
            .blobs
            .into_iter()
            .filter(|(d, _)| base.layers.iter().any(|l| l.digest == *d))
            .collect();
        Self::assemble(base.layers, diff_ids, blobs)
    }

    fn assemble(
        layers: Vec<Descriptor>,
        diff_ids: Vec<Digest>,
        mut blobs: Vec<(Digest, Vec<u8>)>,
    ) -> Self {
        let config = ImageConfig {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            rootfs: RootFs {
                kind: "layers".to_string(),
                diff_ids: diff_ids.clone(),
            },
        };
        let config_bytes = serde_json::to_vec(&config).unwrap();
        let config_desc = Descriptor::for_bytes(media_types::OCI_CONFIG, &config_bytes);
        blobs.push((config_desc.digest.clone(), config_bytes));

        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(media_types::OCI_MANIFEST.to_string()),
            config: config_desc.clone(),
            layers: layers.clone(),
        };
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
        let manifest_desc = Descriptor::for_bytes(media_types::OCI_MANIFEST, &manifest_bytes);
        blobs.push((manifest_desc.digest.clone(), manifest_bytes));

        Self {
            manifest: manifest_desc,
            config: config_desc,
            layers,
            diff_ids,
            blobs,
        }
    }

    pub fn blobs(&self) -> Vec<(Digest, Vec<u8>)> {
        self.blobs.clone()
    }

    /// Put every blob of the fixture into `store`.
    pub async fn load(&self, store: &dyn BlobStore) {
        for (digest, data) in self.blobs() {
            store.put(&digest, data).await.unwrap();
        }
    }
}

/// Serves blobs from a map, counting fetches per digest.
pub(crate) struct MapFetcher {
    blobs: HashMap<Digest, Vec<u8>>,
    fetches: Mutex<HashMap<Digest, usize>>,
    failures: Mutex<HashMap<Digest, usize>>,
}

impl MapFetcher {
    pub fn new(blobs: Vec<(Digest, Vec<u8>)>) -> Self {
        Self {
            blobs: blobs.into_iter().collect(),
            fetches: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Make the next `count` fetches of `digest` fail with an I/O error.
    pub fn fail_next(&self, digest: &Digest, count: usize) {
        self.failures.lock().insert(digest.clone(), count);
    }

    pub fn fetches(&self, digest: &Digest) -> usize {
        self.fetches.lock().get(digest).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().values().sum()
    }
}

#[async_trait]
impl Fetcher for MapFetcher {
    async fn fetch(&self, descriptor: &Descriptor) -> Result<BlobReader> {
        *self
            .fetches
            .lock()
            .entry(descriptor.digest.clone())
            .or_insert(0) += 1;

        if let Some(remaining) = self.failures.lock().get_mut(&descriptor.digest) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(PullError::Io("connection reset".to_string()));
            }
        }

        let data = self
            .blobs
            .get(&descriptor.digest)
            .cloned()
            .ok_or_else(|| PullError::NotFound(format!("blob {}", descriptor.digest)))?;
        Ok(Box::new(Cursor::new(data)))
    }
}

/// In-memory snapshotter that logs every mutating call.
#[derive(Default)]
pub(crate) struct MemorySnapshotter {
    snapshots: Mutex<HashMap<String, SnapshotInfo>>,
    calls: Mutex<Vec<String>>,
}

impl MemorySnapshotter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(op))
            .count()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.snapshots.lock().contains_key(key)
    }

    fn create(&self, key: &str, parent: Option<&str>, kind: SnapshotKind) -> Result<Vec<Mount>> {
        let mut snapshots = self.snapshots.lock();
        if snapshots.contains_key(key) {
            return Err(PullError::AlreadyExists(format!("snapshot {}", key)));
        }
        if let Some(parent) = parent {
            match snapshots.get(parent) {
                Some(info) if info.kind == SnapshotKind::Committed => {}
                Some(_) => {
                    return Err(PullError::FailedPrecondition(format!(
                        "parent {} is not committed",
                        parent
                    )))
                }
                None => return Err(PullError::NotFound(format!("snapshot {}", parent))),
            }
        }
        snapshots.insert(
            key.to_string(),
            SnapshotInfo {
                key: key.to_string(),
                kind,
                parent: parent.map(|p| p.to_string()),
            },
        );
        Ok(vec![Mount::bind(
            format!("/snapshots/{}", key),
            kind == SnapshotKind::View,
        )])
    }
}

#[async_trait]
impl Snapshotter for MemorySnapshotter {
    async fn prepare(&self, key: &str, parent: Option<&str>) -> Result<Vec<Mount>> {
        self.calls.lock().push(format!("prepare {}", key));
        self.create(key, parent, SnapshotKind::Active)
    }

    async fn view(&self, key: &str, parent: Option<&str>) -> Result<Vec<Mount>> {
        self.calls.lock().push(format!("view {}", key));
        self.create(key, parent, SnapshotKind::View)
    }

    async fn mounts(&self, key: &str) -> Result<Vec<Mount>> {
        let snapshots = self.snapshots.lock();
        let info = snapshots
            .get(key)
            .ok_or_else(|| PullError::NotFound(format!("snapshot {}", key)))?;
        Ok(vec![Mount::bind(
            format!("/snapshots/{}", key),
            info.kind != SnapshotKind::Active,
        )])
    }

    async fn commit(&self, key: &str) -> Result<()> {
        self.calls.lock().push(format!("commit {}", key));
        let mut snapshots = self.snapshots.lock();
        let info = snapshots
            .get_mut(key)
            .ok_or_else(|| PullError::NotFound(format!("snapshot {}", key)))?;
        info.kind = SnapshotKind::Committed;
        Ok(())
    }

    async fn stat(&self, key: &str) -> Result<SnapshotInfo> {
        self.snapshots
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| PullError::NotFound(format!("snapshot {}", key)))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.calls.lock().push(format!("remove {}", key));
        self.snapshots
            .lock()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| PullError::NotFound(format!("snapshot {}", key)))
    }
}

/// Diff service that reports each layer's blob digest as its diff ID,
/// unless told otherwise.
#[derive(Default)]
pub(crate) struct EchoDiff {
    overrides: Mutex<HashMap<Digest, Digest>>,
    fail_on: Mutex<Option<Digest>>,
    applied: Mutex<Vec<Digest>>,
}

impl EchoDiff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `reported` when applying the blob `blob`.
    pub fn report(&self, blob: &Digest, reported: Digest) {
        self.overrides.lock().insert(blob.clone(), reported);
    }

    /// Fail with an I/O error when applying `blob`.
    pub fn fail_on(&self, blob: &Digest) {
        *self.fail_on.lock() = Some(blob.clone());
    }

    pub fn applied(&self) -> Vec<Digest> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl DiffService for EchoDiff {
    async fn apply(&self, _mounts: &[Mount], layer: &Descriptor) -> Result<Descriptor> {
        if self.fail_on.lock().as_ref() == Some(&layer.digest) {
            return Err(PullError::Io("disk full".to_string()));
        }
        self.applied.lock().push(layer.digest.clone());
        let digest = self
            .overrides
            .lock()
            .get(&layer.digest)
            .cloned()
            .unwrap_or_else(|| layer.digest.clone());
        Ok(Descriptor::new(media_types::OCI_LAYER, digest, layer.size))
    }
}
