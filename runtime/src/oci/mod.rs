//! Resolvers for OCI content sources.
//!
//! - [`OciLayoutResolver`]: an OCI image layout directory on disk
//! - [`RegistryResolver`]: a remote registry speaking the distribution API

pub mod layout;
pub mod reference;
pub mod registry;

pub use layout::OciLayoutResolver;
pub use reference::ImageReference;
pub use registry::{RegistryAuth, RegistryResolver};
