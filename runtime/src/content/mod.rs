//! Content-addressed blob stores.

mod local;
mod memory;

pub use local::LocalBlobStore;
pub use memory::MemoryBlobStore;

use imgpull_core::{Digest, Result};

/// Check that `data` hashes to `digest` before it is committed.
pub(crate) fn verify_content(digest: &Digest, data: &[u8]) -> Result<()> {
    let mut verifier = digest.verifier();
    verifier.update(data);
    verifier.verify(None)
}
