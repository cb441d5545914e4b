//! Provider capability layer.
//!
//! Every `(provider, type)` pair is served by an implementation of
//! [`ResourceProvider`], selected through the [`ProviderRegistry`] lookup
//! table. Built-in implementations:
//! - [`SandboxProvider`]: simulated AWS, Azure and GCP types on local disk
//! - [`MemoryProvider`]: in-memory map with scripted failures

mod memory;
mod registry;
mod sandbox;
mod traits;

pub use memory::{MemoryProvider, Operation, ProviderEvent};
pub use registry::{ProviderRegistry, ResourceSchema};
pub use sandbox::{SandboxKind, SandboxProvider};
pub use traits::{ProviderResponse, ResourceProvider};

#[cfg(test)]
pub use traits::MockResourceProvider;
