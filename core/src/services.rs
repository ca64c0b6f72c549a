//! Collaborator interfaces consumed by the pull pipeline.
//!
//! Every collaborator is passed explicitly to the components that use it,
//! so each can be replaced by a test double.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::descriptor::{Descriptor, Image};
use crate::digest::Digest;
use crate::error::Result;

/// Byte stream of a fetched blob.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Outcome of resolving a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Canonical name, used as the image store key
    pub name: String,
    /// Root descriptor of the content graph
    pub descriptor: Descriptor,
}

/// Turns a name or tag into a root descriptor and a fetcher for its content.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Fails with `NotFound` if the reference cannot be resolved.
    async fn resolve(&self, reference: &str) -> Result<Resolved>;

    /// A fetcher for content under the canonical `name`.
    async fn fetcher(&self, name: &str) -> Result<Arc<dyn Fetcher>>;
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Open the byte stream of a blob. Fails with `NotFound` or `Io`.
    async fn fetch(&self, descriptor: &Descriptor) -> Result<BlobReader>;
}

/// Content-addressable store of immutable blobs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fails with `NotFound` if the digest is absent.
    async fn get(&self, digest: &Digest) -> Result<Vec<u8>>;

    /// Store `data` under `digest`. Idempotent for identical content; fails
    /// with `DigestMismatch` if `data` does not hash to `digest`.
    async fn put(&self, digest: &Digest, data: Vec<u8>) -> Result<()>;

    async fn exists(&self, digest: &Digest) -> Result<bool>;
}

/// Durable mapping from image name to root descriptor.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Insert or replace; last write wins.
    async fn put(&self, name: &str, target: &Descriptor) -> Result<()>;

    /// Fails with `NotFound` if the name is absent.
    async fn get(&self, name: &str) -> Result<Image>;

    async fn list(&self) -> Result<Vec<Image>>;

    /// Fails with `NotFound` if the name is absent.
    async fn delete(&self, name: &str) -> Result<()>;
}

/// How to mount one piece of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Mount type, e.g. `bind` or `overlay`
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl Mount {
    pub fn bind(source: impl Into<String>, read_only: bool) -> Self {
        let access = if read_only { "ro" } else { "rw" };
        Self {
            kind: "bind".to_string(),
            source: source.into(),
            options: vec![access.to_string(), "rbind".to_string()],
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

/// Lifecycle state of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// Writable, not yet committed
    Active,
    /// Read-only view over a committed parent
    View,
    /// Immutable; may be used as a parent
    Committed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub key: String,
    pub kind: SnapshotKind,
    pub parent: Option<String>,
}

/// Copy-on-write filesystem snapshots keyed by ChainID (or any caller key).
///
/// The snapshotter is the sole arbiter of per-key exclusivity: `prepare` and
/// `view` fail with `AlreadyExists` for a key that is already taken.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    /// Create a writable snapshot on top of the committed `parent`.
    async fn prepare(&self, key: &str, parent: Option<&str>) -> Result<Vec<Mount>>;

    /// Create a read-only view of the committed `parent`.
    async fn view(&self, key: &str, parent: Option<&str>) -> Result<Vec<Mount>>;

    /// Mounts of an existing snapshot. Fails with `NotFound`.
    async fn mounts(&self, key: &str) -> Result<Vec<Mount>>;

    /// Turn the active snapshot `key` into a committed one.
    async fn commit(&self, key: &str) -> Result<()>;

    /// Fails with `NotFound`.
    async fn stat(&self, key: &str) -> Result<SnapshotInfo>;

    /// Remove a snapshot that has no children.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Applies a layer blob onto mounted filesystems.
#[async_trait]
pub trait DiffService: Send + Sync {
    /// Apply `layer` onto `mounts` and return the descriptor of the applied
    /// uncompressed diff (its digest is the diff ID).
    async fn apply(&self, mounts: &[Mount], layer: &Descriptor) -> Result<Descriptor>;

    /// Wait until an abandoned `apply` onto `mounts` has stopped writing.
    ///
    /// Called before the snapshot behind `mounts` is removed. Services whose
    /// work ends with the `apply` future need not override it.
    async fn settle(&self, _mounts: &[Mount]) -> Result<()> {
        Ok(())
    }
}
