//! Snapshotter implementations.

mod dir;

pub use dir::DirSnapshotter;
