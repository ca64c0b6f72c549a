//! Disk-backed image store.
//!
//! Records live in an in-memory map persisted to `images.json` after every
//! change. The file is replaced atomically so a crash never leaves it
//! half-written.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imgpull_core::{Descriptor, Image, ImageStore, PullError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

const INDEX_FILE: &str = "images.json";

/// A named image with bookkeeping timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub name: String,
    pub target: Descriptor,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    images: Vec<ImageRecord>,
}

pub struct LocalImageStore {
    root: PathBuf,
    records: RwLock<BTreeMap<String, ImageRecord>>,
}

impl LocalImageStore {
    /// Open the store at `root`, creating the directory and loading any
    /// existing index.
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| {
            PullError::Io(format!(
                "Failed to create image store directory {}: {}",
                root.display(),
                e
            ))
        })?;

        let records = load_index(&root.join(INDEX_FILE))?;
        Ok(Self {
            root: root.to_path_buf(),
            records: RwLock::new(records),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full record for `name`, including timestamps.
    pub async fn record(&self, name: &str) -> Result<ImageRecord> {
        self.records
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| PullError::NotFound(format!("image {}", name)))
    }

    async fn save(&self, records: &BTreeMap<String, ImageRecord>) -> Result<()> {
        let index = StoreIndex {
            images: records.values().cloned().collect(),
        };
        let data = serde_json::to_vec_pretty(&index)?;

        let path = self.root.join(INDEX_FILE);
        let tmp = self.root.join(format!("{}.tmp", INDEX_FILE));
        tokio::fs::write(&tmp, data).await.map_err(|e| {
            PullError::Io(format!(
                "Failed to write image store index {}: {}",
                tmp.display(),
                e
            ))
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            PullError::Io(format!(
                "Failed to replace image store index {}: {}",
                path.display(),
                e
            ))
        })
    }
}

fn load_index(path: &Path) -> Result<BTreeMap<String, ImageRecord>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let data = std::fs::read(path).map_err(|e| {
        PullError::Io(format!(
            "Failed to read image store index {}: {}",
            path.display(),
            e
        ))
    })?;
    let index: StoreIndex = serde_json::from_slice(&data).map_err(|e| {
        PullError::Serialization(format!("Failed to parse image store index: {}", e))
    })?;
    Ok(index
        .images
        .into_iter()
        .map(|record| (record.name.clone(), record))
        .collect())
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn put(&self, name: &str, target: &Descriptor) -> Result<()> {
        let mut records = self.records.write().await;
        let now = Utc::now();
        let previous = records.get(name).cloned();

        match records.get_mut(name) {
            Some(record) => {
                record.target = target.clone();
                record.updated_at = now;
            }
            None => {
                records.insert(
                    name.to_string(),
                    ImageRecord {
                        name: name.to_string(),
                        target: target.clone(),
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }

        if let Err(e) = self.save(&records).await {
            // Keep memory consistent with what is on disk.
            match previous {
                Some(record) => records.insert(name.to_string(), record),
                None => records.remove(name),
            };
            return Err(e);
        }

        debug!(name, digest = %target.digest, "Recorded image");
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Image> {
        let record = self.record(name).await?;
        Ok(Image {
            name: record.name,
            target: record.target,
        })
    }

    async fn list(&self) -> Result<Vec<Image>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .map(|record| Image {
                name: record.name.clone(),
                target: record.target.clone(),
            })
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut records = self.records.write().await;
        let removed = records
            .remove(name)
            .ok_or_else(|| PullError::NotFound(format!("image {}", name)))?;

        if let Err(e) = self.save(&records).await {
            records.insert(name.to_string(), removed);
            return Err(e);
        }
        Ok(())
    }
}
