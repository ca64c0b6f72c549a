//! Directory-backed snapshotter.
//!
//! Each snapshot is a plain directory under `snapshots/<id>/fs`. Preparing a
//! child copies its parent's tree, so snapshots never share files and a
//! committed snapshot stays unchanged whatever happens to its children.
//! Snapshot metadata is persisted to `metadata.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imgpull_core::{Digest, Mount, PullError, Result, SnapshotInfo, SnapshotKind, Snapshotter};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::fs::{copy_dir_recursive, dir_size, remove_path};

const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotRecord {
    id: String,
    kind: SnapshotKind,
    parent: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Metadata {
    snapshots: BTreeMap<String, SnapshotRecord>,
}

pub struct DirSnapshotter {
    root: PathBuf,
    metadata: Mutex<Metadata>,
}

impl DirSnapshotter {
    /// Open (creating if needed) a snapshotter rooted at `root`.
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root.join("snapshots")).map_err(|e| {
            PullError::Io(format!(
                "Failed to create snapshot directory {}: {}",
                root.display(),
                e
            ))
        })?;

        let path = root.join(METADATA_FILE);
        let mut metadata = if path.exists() {
            let data = std::fs::read(&path)?;
            serde_json::from_slice(&data).map_err(|e| {
                PullError::Serialization(format!("Failed to parse snapshot metadata: {}", e))
            })?
        } else {
            Metadata::default()
        };

        drop_interrupted(root, &mut metadata)?;

        Ok(Self {
            root: root.to_path_buf(),
            metadata: Mutex::new(metadata),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bytes used by the files of snapshot `key`.
    pub async fn usage(&self, key: &str) -> Result<u64> {
        let dir = {
            let metadata = self.metadata.lock().await;
            let record = lookup(&metadata, key)?;
            self.fs_dir(&record.id)
        };
        tokio::task::spawn_blocking(move || dir_size(&dir))
            .await
            .map_err(|e| PullError::Io(format!("usage task failed: {}", e)))
    }

    fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.root.join("snapshots").join(id)
    }

    fn fs_dir(&self, id: &str) -> PathBuf {
        self.snapshot_dir(id).join("fs")
    }

    fn mount(&self, record: &SnapshotRecord) -> Mount {
        Mount::bind(
            self.fs_dir(&record.id).to_string_lossy(),
            record.kind != SnapshotKind::Active,
        )
    }

    async fn save(&self, metadata: &Metadata) -> Result<()> {
        let data = serde_json::to_vec_pretty(metadata)?;
        let path = self.root.join(METADATA_FILE);
        let tmp = self.root.join(format!("{}.tmp", METADATA_FILE));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn create(&self, key: &str, parent: Option<&str>, kind: SnapshotKind) -> Result<Vec<Mount>> {
        let (record, parent_dir) = {
            let mut metadata = self.metadata.lock().await;
            if metadata.snapshots.contains_key(key) {
                return Err(PullError::AlreadyExists(format!("snapshot {}", key)));
            }

            let parent_dir = match parent {
                Some(parent) => {
                    let record = lookup(&metadata, parent)?;
                    if record.kind != SnapshotKind::Committed {
                        return Err(PullError::FailedPrecondition(format!(
                            "parent snapshot {} is not committed",
                            parent
                        )));
                    }
                    Some(self.fs_dir(&record.id))
                }
                None => None,
            };

            let record = SnapshotRecord {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                parent: parent.map(|p| p.to_string()),
                created_at: Utc::now(),
            };
            metadata.snapshots.insert(key.to_string(), record.clone());
            if let Err(e) = self.save(&metadata).await {
                metadata.snapshots.remove(key);
                return Err(e);
            }
            (record, parent_dir)
        };

        let fs_dir = self.fs_dir(&record.id);
        let target = fs_dir.clone();
        let populated = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&target)?;
            if let Some(parent_dir) = parent_dir {
                copy_dir_recursive(&parent_dir, &target)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| PullError::Io(format!("snapshot copy task failed: {}", e)))
        .and_then(|r| r.map_err(PullError::from));

        if let Err(e) = populated {
            warn!(key, error = %e, "Failed to populate snapshot");
            let mut metadata = self.metadata.lock().await;
            metadata.snapshots.remove(key);
            if let Err(e) = self.save(&metadata).await {
                warn!(key, error = %e, "Failed to save snapshot metadata");
            }
            drop(metadata);
            if let Err(e) = remove_path(&self.snapshot_dir(&record.id)) {
                warn!(key, error = %e, "Failed to remove snapshot directory");
            }
            return Err(e);
        }

        debug!(key, parent = ?parent, kind = ?kind, "Created snapshot");
        Ok(vec![self.mount(&record)])
    }
}

/// Forget layer snapshots a previous process prepared but never
/// committed.
///
/// Unpack work is keyed by ChainID, so an active snapshot under a digest
/// key can only be a layer that was interrupted mid-apply. Snapshots
/// under any other key belong to their caller and are kept.
fn drop_interrupted(root: &Path, metadata: &mut Metadata) -> Result<()> {
    let interrupted: Vec<String> = metadata
        .snapshots
        .iter()
        .filter(|(key, record)| {
            record.kind == SnapshotKind::Active && Digest::parse(key).is_ok()
        })
        .map(|(key, _)| key.clone())
        .collect();
    if interrupted.is_empty() {
        return Ok(());
    }

    for key in &interrupted {
        if let Some(record) = metadata.snapshots.remove(key) {
            remove_path(&root.join("snapshots").join(&record.id))?;
            info!(key = %key, "Dropped interrupted layer snapshot");
        }
    }

    let data = serde_json::to_vec_pretty(&*metadata)?;
    let tmp = root.join(format!("{}.tmp", METADATA_FILE));
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, root.join(METADATA_FILE))?;
    Ok(())
}

fn lookup<'a>(metadata: &'a Metadata, key: &str) -> Result<&'a SnapshotRecord> {
    metadata
        .snapshots
        .get(key)
        .ok_or_else(|| PullError::NotFound(format!("snapshot {}", key)))
}

#[async_trait]
impl Snapshotter for DirSnapshotter {
    async fn prepare(&self, key: &str, parent: Option<&str>) -> Result<Vec<Mount>> {
        self.create(key, parent, SnapshotKind::Active).await
    }

    async fn view(&self, key: &str, parent: Option<&str>) -> Result<Vec<Mount>> {
        self.create(key, parent, SnapshotKind::View).await
    }

    async fn mounts(&self, key: &str) -> Result<Vec<Mount>> {
        let metadata = self.metadata.lock().await;
        Ok(vec![self.mount(lookup(&metadata, key)?)])
    }

    async fn commit(&self, key: &str) -> Result<()> {
        let mut metadata = self.metadata.lock().await;
        let record = metadata
            .snapshots
            .get_mut(key)
            .ok_or_else(|| PullError::NotFound(format!("snapshot {}", key)))?;
        if record.kind != SnapshotKind::Active {
            return Err(PullError::FailedPrecondition(format!(
                "snapshot {} is {:?}, only active snapshots can be committed",
                key, record.kind
            )));
        }
        record.kind = SnapshotKind::Committed;

        if let Err(e) = self.save(&metadata).await {
            if let Some(record) = metadata.snapshots.get_mut(key) {
                record.kind = SnapshotKind::Active;
            }
            return Err(e);
        }
        debug!(key, "Committed snapshot");
        Ok(())
    }

    async fn stat(&self, key: &str) -> Result<SnapshotInfo> {
        let metadata = self.metadata.lock().await;
        let record = lookup(&metadata, key)?;
        Ok(SnapshotInfo {
            key: key.to_string(),
            kind: record.kind,
            parent: record.parent.clone(),
        })
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let record = {
            let mut metadata = self.metadata.lock().await;
            lookup(&metadata, key)?;
            if let Some(child) = metadata
                .snapshots
                .iter()
                .find(|(_, r)| r.parent.as_deref() == Some(key))
                .map(|(k, _)| k.clone())
            {
                return Err(PullError::FailedPrecondition(format!(
                    "snapshot {} is the parent of {}",
                    key, child
                )));
            }
            let Some(record) = metadata.snapshots.remove(key) else {
                return Err(PullError::NotFound(format!("snapshot {}", key)));
            };
            if let Err(e) = self.save(&metadata).await {
                metadata.snapshots.insert(key.to_string(), record);
                return Err(e);
            }
            record
        };

        let dir = self.snapshot_dir(&record.id);
        tokio::task::spawn_blocking(move || remove_path(&dir))
            .await
            .map_err(|e| PullError::Io(format!("snapshot removal task failed: {}", e)))??;
        debug!(key, "Removed snapshot");
        Ok(())
    }
}
