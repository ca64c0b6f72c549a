//! Diff services: apply a layer blob onto a mounted snapshot.

mod apply;

pub use apply::{apply_layer, TarApplier};
