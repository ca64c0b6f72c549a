//! imgpull core - content model and collaborator interfaces
//!
//! Foundational types shared by the pull pipeline: descriptors and digests,
//! ChainID folding, the error taxonomy, pull configuration, and the traits
//! through which the pipeline reaches its collaborators.

pub mod config;
pub mod descriptor;
pub mod digest;
pub mod error;
pub mod services;

// Re-export commonly used types
pub use config::{PullOptions, RetryPolicy};
pub use descriptor::{
    media_types, uncompressed_media_type, Descriptor, Image, ImageConfig, Index, Layer, Manifest,
    NodeKind, Platform, RootFs,
};
pub use digest::{chain_id, chain_ids, Algorithm, Digest, Digester, DigestVerifier};
pub use error::{PullError, Result};
pub use services::{
    BlobReader, BlobStore, DiffService, Fetcher, ImageStore, Mount, Resolved, Resolver,
    SnapshotInfo, SnapshotKind, Snapshotter,
};

/// imgpull version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
