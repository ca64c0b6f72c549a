//! Image stores: name to root descriptor.

mod local;
mod memory;

pub use local::{ImageRecord, LocalImageStore};
pub use memory::MemoryImageStore;
