//! Content model: descriptors, manifests, image configs and layers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Well-known OCI and Docker media types.
pub mod media_types {
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
    pub const OCI_LAYER_NONDISTRIBUTABLE: &str =
        "application/vnd.oci.image.layer.nondistributable.v1.tar";
    pub const OCI_LAYER_NONDISTRIBUTABLE_GZIP: &str =
        "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";

    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
    pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
    pub const DOCKER_LAYER_FOREIGN_GZIP: &str =
        "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
}

/// What role a node plays in the content graph, derived from its media type.
///
/// Only indexes and manifests have children; every other kind is a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Index,
    Manifest,
    Config,
    Layer,
    Unknown,
}

impl NodeKind {
    pub fn from_media_type(media_type: &str) -> Self {
        use media_types::*;

        match media_type {
            OCI_INDEX | DOCKER_MANIFEST_LIST => NodeKind::Index,
            OCI_MANIFEST | DOCKER_MANIFEST => NodeKind::Manifest,
            OCI_CONFIG | DOCKER_CONFIG => NodeKind::Config,
            mt if mt.starts_with("application/vnd.oci.image.layer.")
                || mt.starts_with("application/vnd.docker.image.rootfs.") =>
            {
                NodeKind::Layer
            }
            _ => NodeKind::Unknown,
        }
    }

    pub fn has_children(&self) -> bool {
        matches!(self, NodeKind::Index | NodeKind::Manifest)
    }
}

/// Media type of a layer's uncompressed diff, given the media type of the
/// (possibly compressed) blob that carries it.
pub fn uncompressed_media_type(media_type: &str) -> String {
    for suffix in ["+gzip", "+zstd", ".gzip"] {
        if let Some(base) = media_type.strip_suffix(suffix) {
            return base.to_string();
        }
    }
    media_type.to_string()
}

/// Target platform of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            architecture: architecture.into(),
            os: os.into(),
            variant: None,
        }
    }

    /// Linux on the host's CPU architecture.
    ///
    /// Images are unpacked into Linux root filesystems regardless of the
    /// host OS, so only the architecture follows the host.
    pub fn host() -> Self {
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            other => other,
        };
        Self::new("linux", arch)
    }

    /// Parse `os/arch[/variant]`, e.g. `linux/arm64/v8`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('/');
        let os = parts.next().filter(|p| !p.is_empty())?;
        let arch = parts.next().filter(|p| !p.is_empty())?;
        let variant = parts.next().map(|v| v.to_string());
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            architecture: arch.to_string(),
            os: os.to_string(),
            variant,
        })
    }

    /// Whether a manifest built for `other` can run on `self`.
    /// A missing variant on either side matches any variant.
    pub fn matches(&self, other: &Platform) -> bool {
        if self.os != other.os || self.architecture != other.architecture {
            return false;
        }
        match (&self.variant, &other.variant) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Identifies a blob by media type, digest and size.
///
/// Two descriptors with the same digest are interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: Digest, size: i64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            platform: None,
            annotations: None,
        }
    }

    /// Describe `data` as a blob of the given media type.
    pub fn for_bytes(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self::new(media_type, Digest::from_bytes(data), data.len() as i64)
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn kind(&self) -> NodeKind {
        NodeKind::from_media_type(&self.media_type)
    }

    /// Declared size, if it is a usable length (negative sizes are unknown).
    pub fn expected_size(&self) -> Option<u64> {
        u64::try_from(self.size).ok()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(|s| s.as_str())
    }
}

/// A named image: the root descriptor recorded in the image store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    pub target: Descriptor,
}

/// Image manifest. Layers are ordered bottom (base) to top.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

/// Multi-platform image index (manifest list).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

/// The part of an image configuration blob this pipeline reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    pub rootfs: RootFs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub diff_ids: Vec<Digest>,
}

/// One layer, pairing its uncompressed diff identity with the fetched blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Uncompressed diff: digest is the diff ID.
    pub diff: Descriptor,
    /// The fetched, possibly compressed, blob.
    pub blob: Descriptor,
}
