//! Provider contracts consumed by the engine.
//!
//! Providers own the knowledge of how to read and change one resource type
//! on a target. The engine only sees them through the [`Provider`] trait and
//! looks them up by type in a [`ProviderRegistry`].

mod memory;
mod registry;

pub use memory::MemoryProvider;
pub use registry::{Provider, ProviderRegistry, RegistryApplier};
