//! Resolver over an OCI image layout directory.
//!
//! ```text
//! image/
//! ├── oci-layout
//! ├── index.json
//! └── blobs/<algorithm>/<hex>
//! ```
//!
//! References are matched against the `org.opencontainers.image.ref.name`
//! and `io.containerd.image.name` annotations of `index.json` entries, or
//! against an entry's digest.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use imgpull_core::{
    BlobReader, Descriptor, Digest, Fetcher, Index, PullError, Resolved, Resolver, Result,
};
use tracing::debug;

pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";
pub const ANNOTATION_IMAGE_NAME: &str = "io.containerd.image.name";

pub struct OciLayoutResolver {
    root: PathBuf,
}

impl OciLayoutResolver {
    /// Open a layout, checking that its marker files are present.
    pub fn new(root: &Path) -> Result<Self> {
        for required in ["oci-layout", "index.json"] {
            if !root.join(required).is_file() {
                return Err(PullError::NotFound(format!(
                    "{} is not an OCI image layout: missing {}",
                    root.display(),
                    required
                )));
            }
        }
        if !root.join("blobs").is_dir() {
            return Err(PullError::NotFound(format!(
                "{} is not an OCI image layout: missing blobs/",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn index(&self) -> Result<Index> {
        let data = tokio::fs::read(self.root.join("index.json")).await?;
        serde_json::from_slice(&data)
            .map_err(|e| PullError::Serialization(format!("layout index.json: {}", e)))
    }
}

#[async_trait]
impl Resolver for OciLayoutResolver {
    async fn resolve(&self, reference: &str) -> Result<Resolved> {
        let reference = reference.trim();
        let index = self.index().await?;
        let pinned = Digest::parse(reference).ok();

        let descriptor = index
            .manifests
            .into_iter()
            .find(|entry| {
                pinned.as_ref() == Some(&entry.digest)
                    || entry.annotation(ANNOTATION_REF_NAME) == Some(reference)
                    || entry.annotation(ANNOTATION_IMAGE_NAME) == Some(reference)
            })
            .ok_or_else(|| {
                PullError::NotFound(format!(
                    "reference '{}' not found in {}",
                    reference,
                    self.root.display()
                ))
            })?;

        debug!(reference, digest = %descriptor.digest, "Resolved from layout");
        Ok(Resolved {
            name: reference.to_string(),
            descriptor,
        })
    }

    async fn fetcher(&self, _name: &str) -> Result<Arc<dyn Fetcher>> {
        Ok(Arc::new(LayoutFetcher {
            root: self.root.clone(),
        }))
    }
}

struct LayoutFetcher {
    root: PathBuf,
}

#[async_trait]
impl Fetcher for LayoutFetcher {
    async fn fetch(&self, descriptor: &Descriptor) -> Result<BlobReader> {
        let path = self
            .root
            .join("blobs")
            .join(descriptor.digest.algorithm().as_str())
            .join(descriptor.digest.hex());
        let file = tokio::fs::File::open(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                PullError::NotFound(format!("blob {}", descriptor.digest))
            }
            _ => PullError::Io(format!("Failed to open {}: {}", path.display(), e)),
        })?;
        Ok(Box::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgpull_core::media_types;
    use std::collections::HashMap;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn write_layout(dir: &Path, manifest: &[u8], name: &str) -> Descriptor {
        let mut desc = Descriptor::for_bytes(media_types::OCI_MANIFEST, manifest);
        desc.annotations = Some(HashMap::from([(
            ANNOTATION_REF_NAME.to_string(),
            name.to_string(),
        )]));

        std::fs::create_dir_all(dir.join("blobs/sha256")).unwrap();
        std::fs::write(dir.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();
        std::fs::write(dir.join("blobs/sha256").join(desc.digest.hex()), manifest).unwrap();
        let index = Index {
            schema_version: 2,
            media_type: Some(media_types::OCI_INDEX.to_string()),
            manifests: vec![desc.clone()],
        };
        std::fs::write(dir.join("index.json"), serde_json::to_vec(&index).unwrap()).unwrap();
        desc
    }

    #[test]
    fn test_new_rejects_non_layout() {
        let tmp = TempDir::new().unwrap();
        let err = OciLayoutResolver::new(tmp.path()).err().unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_resolve_by_ref_name_and_digest() {
        let tmp = TempDir::new().unwrap();
        let desc = write_layout(tmp.path(), b"{}", "v1");
        let resolver = OciLayoutResolver::new(tmp.path()).unwrap();

        let by_name = resolver.resolve("v1").await.unwrap();
        assert_eq!(by_name.descriptor.digest, desc.digest);
        assert_eq!(by_name.name, "v1");

        let by_digest = resolver.resolve(&desc.digest.to_string()).await.unwrap();
        assert_eq!(by_digest.descriptor.digest, desc.digest);
    }

    #[tokio::test]
    async fn test_resolve_unknown_reference() {
        let tmp = TempDir::new().unwrap();
        write_layout(tmp.path(), b"{}", "v1");
        let resolver = OciLayoutResolver::new(tmp.path()).unwrap();
        assert!(resolver.resolve("v2").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_fetch_streams_blob() {
        let tmp = TempDir::new().unwrap();
        let desc = write_layout(tmp.path(), b"{\"schemaVersion\":2}", "v1");
        let resolver = OciLayoutResolver::new(tmp.path()).unwrap();

        let fetcher = resolver.fetcher("v1").await.unwrap();
        let mut reader = fetcher.fetch(&desc).await.unwrap();
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"{\"schemaVersion\":2}");

        let missing = Descriptor::for_bytes(media_types::OCI_LAYER, b"nope");
        let err = fetcher.fetch(&missing).await.err().unwrap();
        assert!(err.is_not_found());
    }
}
