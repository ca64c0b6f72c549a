//! Shared fixtures for pipeline integration tests: on-disk OCI layouts
//! built from real tar layers, plus recording wrappers around the bundled
//! collaborators.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use imgpull_core::{
    media_types, BlobReader, Descriptor, DiffService, Digest, Fetcher, ImageConfig, Index,
    Manifest, Mount, PullError, Resolved, Resolver, Result, RootFs, SnapshotInfo, Snapshotter,
};
use imgpull_runtime::oci::layout::ANNOTATION_REF_NAME;
use imgpull_runtime::{
    DirSnapshotter, ImagePuller, LocalBlobStore, LocalImageStore, OciLayoutResolver,
    PullServices, TarApplier,
};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const IMAGE: &str = "example.com/app:1.0";

/// Files of one layer: `(path, content)`; a `None` content marks a
/// directory.
pub type LayerFiles<'a> = &'a [(&'a str, Option<&'a str>)];

/// Build a gzip-compressed tar layer. Returns the blob and its diff ID.
pub fn tar_layer(files: LayerFiles) -> (Vec<u8>, Digest) {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        match content {
            Some(data) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(data.len() as u64);
                builder
                    .append_data(&mut header, path, data.as_bytes())
                    .unwrap();
            }
            None => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder
                    .append_data(&mut header, path, std::io::empty())
                    .unwrap();
            }
        }
    }
    let tar = builder.into_inner().unwrap();
    let diff_id = Digest::from_bytes(&tar);

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar).unwrap();
    (encoder.finish().unwrap(), diff_id)
}

/// An image written into an OCI layout.
pub struct LayoutImage {
    pub manifest: Descriptor,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    pub diff_ids: Vec<Digest>,
}

/// Writes blobs and `index.json` entries into an OCI layout directory.
pub struct LayoutBuilder {
    root: PathBuf,
    entries: Vec<Descriptor>,
}

impl LayoutBuilder {
    pub fn new(root: &Path) -> Self {
        std::fs::create_dir_all(root.join("blobs/sha256")).unwrap();
        std::fs::write(root.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();
        let builder = Self {
            root: root.to_path_buf(),
            entries: Vec::new(),
        };
        builder.write_index();
        builder
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs/sha256").join(digest.hex())
    }

    pub fn write_blob(&self, media_type: &str, data: &[u8]) -> Descriptor {
        let desc = Descriptor::for_bytes(media_type, data);
        std::fs::write(self.blob_path(&desc.digest), data).unwrap();
        desc
    }

    /// Add an image whose config lists the layers' true diff IDs.
    pub fn add_image(&mut self, name: &str, layers: &[LayerFiles]) -> LayoutImage {
        self.add_image_with(name, layers, |diff_ids| diff_ids)
    }

    /// Add an image whose config diff IDs are rewritten by `edit`.
    pub fn add_image_with(
        &mut self,
        name: &str,
        layers: &[LayerFiles],
        edit: impl FnOnce(Vec<Digest>) -> Vec<Digest>,
    ) -> LayoutImage {
        let mut layer_descs = Vec::new();
        let mut diff_ids = Vec::new();
        for files in layers {
            let (blob, diff_id) = tar_layer(files);
            layer_descs.push(self.write_blob(media_types::OCI_LAYER_GZIP, &blob));
            diff_ids.push(diff_id);
        }

        let config = ImageConfig {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            rootfs: RootFs {
                kind: "layers".to_string(),
                diff_ids: edit(diff_ids.clone()),
            },
        };
        let config = self.write_blob(
            media_types::OCI_CONFIG,
            &serde_json::to_vec(&config).unwrap(),
        );

        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(media_types::OCI_MANIFEST.to_string()),
            config: config.clone(),
            layers: layer_descs.clone(),
        };
        let mut manifest_desc = self.write_blob(
            media_types::OCI_MANIFEST,
            &serde_json::to_vec(&manifest).unwrap(),
        );
        manifest_desc.annotations = Some(HashMap::from([(
            ANNOTATION_REF_NAME.to_string(),
            name.to_string(),
        )]));
        self.entries.push(manifest_desc.clone());
        self.write_index();

        LayoutImage {
            manifest: manifest_desc,
            config,
            layers: layer_descs,
            diff_ids,
        }
    }

    fn write_index(&self) {
        let index = Index {
            schema_version: 2,
            media_type: Some(media_types::OCI_INDEX.to_string()),
            manifests: self.entries.clone(),
        };
        std::fs::write(
            self.root.join("index.json"),
            serde_json::to_vec_pretty(&index).unwrap(),
        )
        .unwrap();
    }
}

/// Resolver wrapper counting every blob fetch.
pub struct CountingResolver {
    inner: OciLayoutResolver,
    fetches: Arc<AtomicUsize>,
}

impl CountingResolver {
    pub fn new(inner: OciLayoutResolver) -> Self {
        Self {
            inner,
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.fetches.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl Resolver for CountingResolver {
    async fn resolve(&self, reference: &str) -> Result<Resolved> {
        self.inner.resolve(reference).await
    }

    async fn fetcher(&self, name: &str) -> Result<Arc<dyn Fetcher>> {
        Ok(Arc::new(CountingFetcher {
            inner: self.inner.fetcher(name).await?,
            fetches: self.fetches.clone(),
        }))
    }
}

struct CountingFetcher {
    inner: Arc<dyn Fetcher>,
    fetches: Arc<AtomicUsize>,
}

#[async_trait]
impl Fetcher for CountingFetcher {
    async fn fetch(&self, descriptor: &Descriptor) -> Result<BlobReader> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(descriptor).await
    }
}

/// Snapshotter wrapper logging `op key` for every call.
pub struct RecordingSnapshotter {
    inner: DirSnapshotter,
    calls: Mutex<Vec<String>>,
}

impl RecordingSnapshotter {
    pub fn new(inner: DirSnapshotter) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_of(&self, op: &str) -> Vec<String> {
        let prefix = format!("{} ", op);
        self.calls
            .lock()
            .iter()
            .filter_map(|c| c.strip_prefix(&prefix).map(|k| k.to_string()))
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, op: &str, key: &str) {
        self.calls.lock().push(format!("{} {}", op, key));
    }
}

#[async_trait]
impl Snapshotter for RecordingSnapshotter {
    async fn prepare(&self, key: &str, parent: Option<&str>) -> Result<Vec<Mount>> {
        self.record("prepare", key);
        self.inner.prepare(key, parent).await
    }

    async fn view(&self, key: &str, parent: Option<&str>) -> Result<Vec<Mount>> {
        self.record("view", key);
        self.inner.view(key, parent).await
    }

    async fn mounts(&self, key: &str) -> Result<Vec<Mount>> {
        self.inner.mounts(key).await
    }

    async fn commit(&self, key: &str) -> Result<()> {
        self.record("commit", key);
        self.inner.commit(key).await
    }

    async fn stat(&self, key: &str) -> Result<SnapshotInfo> {
        self.inner.stat(key).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.record("remove", key);
        self.inner.remove(key).await
    }
}

/// What the scripted diff service does on a given apply call.
pub enum Script {
    /// Fail with a transient I/O error.
    Fail,
    /// Cancel the token and never finish.
    CancelAndHang(CancellationToken),
}

/// Diff service that delegates to [`TarApplier`] unless a script entry
/// exists for the current call number (0-based).
pub struct ScriptedDiff {
    inner: TarApplier,
    calls: AtomicUsize,
    script: Mutex<HashMap<usize, Script>>,
}

impl ScriptedDiff {
    pub fn new(inner: TarApplier) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            script: Mutex::new(HashMap::new()),
        }
    }

    pub fn on_call(&self, call: usize, action: Script) {
        self.script.lock().insert(call, action);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiffService for ScriptedDiff {
    async fn apply(&self, mounts: &[Mount], layer: &Descriptor) -> Result<Descriptor> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let action = self.script.lock().remove(&call);
        match action {
            Some(Script::Fail) => Err(PullError::Io("injected apply failure".to_string())),
            Some(Script::CancelAndHang(token)) => {
                token.cancel();
                std::future::pending().await
            }
            None => self.inner.apply(mounts, layer).await,
        }
    }
}

/// A full on-disk pipeline in a temporary directory.
pub struct Env {
    pub tmp: TempDir,
    pub layout: LayoutBuilder,
    pub resolver: Arc<CountingResolver>,
    pub content: Arc<LocalBlobStore>,
    pub images: Arc<LocalImageStore>,
    pub snapshotter: Arc<RecordingSnapshotter>,
    pub diff: Arc<ScriptedDiff>,
    pub puller: ImagePuller,
}

impl Env {
    /// Set up the stores and a layout, letting `populate` add images before
    /// the resolver opens the layout.
    pub fn new(populate: impl FnOnce(&mut LayoutBuilder)) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut layout = LayoutBuilder::new(&tmp.path().join("layout"));
        populate(&mut layout);

        let resolver = Arc::new(CountingResolver::new(
            OciLayoutResolver::new(&tmp.path().join("layout")).unwrap(),
        ));
        let content = Arc::new(LocalBlobStore::new(&tmp.path().join("content")).unwrap());
        let images = Arc::new(LocalImageStore::new(&tmp.path().join("images")).unwrap());
        let snapshotter = Arc::new(RecordingSnapshotter::new(
            DirSnapshotter::new(&tmp.path().join("snapshots")).unwrap(),
        ));
        let diff = Arc::new(ScriptedDiff::new(TarApplier::new(content.clone())));

        let puller = ImagePuller::new(PullServices {
            resolver: resolver.clone(),
            content: content.clone(),
            images: images.clone(),
            snapshotter: snapshotter.clone(),
            diff: diff.clone(),
        });

        Self {
            tmp,
            layout,
            resolver,
            content,
            images,
            snapshotter,
            diff,
            puller,
        }
    }

    /// Host path of a snapshot's files.
    pub async fn snapshot_path(&self, key: &str) -> PathBuf {
        let mounts = self.snapshotter.mounts(key).await.unwrap();
        PathBuf::from(&mounts[0].source)
    }
}
