//! imgpull runtime - image pull and unpack pipeline.
//!
//! Fetches an image's content graph into a blob store, records it in an
//! image store, and unpacks its layers into a chain of snapshots keyed by
//! ChainID. Ships on-disk and in-memory implementations of every
//! collaborator alongside the orchestration.

#![allow(clippy::result_large_err)]

mod cancel;
pub mod content;
pub mod diff;
pub mod dispatch;
pub mod fs;
pub mod layers;
pub mod metrics;
pub mod oci;
pub mod pull;
pub mod rootfs;
pub mod snapshot;
pub mod store;
pub mod unpack;

#[cfg(test)]
mod testutil;

// Re-export common types
pub use content::{LocalBlobStore, MemoryBlobStore};
pub use diff::TarApplier;
pub use dispatch::{DispatchSummary, Dispatcher};
pub use layers::LayerResolver;
pub use metrics::PullMetrics;
pub use oci::{ImageReference, OciLayoutResolver, RegistryAuth, RegistryResolver};
pub use pull::{ImagePuller, PullServices};
pub use rootfs::{RootfsMode, RootfsProvisioner};
pub use snapshot::DirSnapshotter;
pub use store::{ImageRecord, LocalImageStore, MemoryImageStore};
pub use unpack::{SnapshotUnpacker, UnpackSummary};

/// imgpull runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
