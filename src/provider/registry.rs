//! Lookup table from `(provider, type)` to a provider implementation.

use crate::config::ResourceId;
use crate::error::{CirrusError, Result, ValidationError};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use super::sandbox::{SandboxKind, SandboxProvider};
use super::traits::ResourceProvider;

/// Static description of a resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSchema {
    /// Provider name.
    pub provider: String,
    /// Resource type.
    pub resource_type: String,
    /// Attributes every spec of this type must declare.
    pub required: Vec<String>,
    /// Attributes that cannot change without recreating the resource.
    pub immutable: Vec<String>,
    /// Computed outputs the provider reports.
    pub outputs: Vec<String>,
}

impl ResourceSchema {
    /// Creates a schema with no constraints.
    #[must_use]
    pub fn new(provider: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            resource_type: resource_type.into(),
            required: Vec::new(),
            immutable: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Sets the required attributes.
    #[must_use]
    pub fn with_required(mut self, keys: &[&str]) -> Self {
        self.required = keys.iter().map(ToString::to_string).collect();
        self
    }

    /// Sets the immutable attributes.
    #[must_use]
    pub fn with_immutable(mut self, keys: &[&str]) -> Self {
        self.immutable = keys.iter().map(ToString::to_string).collect();
        self
    }

    /// Sets the computed outputs.
    #[must_use]
    pub fn with_outputs(mut self, keys: &[&str]) -> Self {
        self.outputs = keys.iter().map(ToString::to_string).collect();
        self
    }
}

struct Entry {
    schema: ResourceSchema,
    provider: Arc<dyn ResourceProvider>,
}

/// Provider lookup table.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: BTreeMap<(String, String), Entry>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("types", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every built-in sandbox type, storing
    /// simulated resources under `root`.
    #[must_use]
    pub fn sandbox(root: impl AsRef<Path>) -> Self {
        let mut registry = Self::new();
        for kind in SandboxKind::ALL {
            registry.register(
                kind.schema(),
                Arc::new(SandboxProvider::new(root.as_ref(), kind)),
            );
        }
        registry
    }

    /// Registers (or replaces) the provider for a schema's pair.
    pub fn register(&mut self, schema: ResourceSchema, provider: Arc<dyn ResourceProvider>) {
        self.entries.insert(
            (schema.provider.clone(), schema.resource_type.clone()),
            Entry { schema, provider },
        );
    }

    fn entry(&self, id: &ResourceId) -> Option<&Entry> {
        self.entries
            .get(&(id.provider.clone(), id.resource_type.clone()))
    }

    /// Returns the provider for a resource's pair.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the resource if no provider is
    /// registered for its pair.
    pub fn get(&self, id: &ResourceId) -> Result<Arc<dyn ResourceProvider>> {
        self.entry(id)
            .map(|entry| Arc::clone(&entry.provider))
            .ok_or_else(|| {
                CirrusError::Validation(ValidationError::UnsupportedResourceType {
                    provider: id.provider.clone(),
                    resource_type: id.resource_type.clone(),
                    resource: id.to_string(),
                })
            })
    }

    /// Returns the schema for a resource's pair.
    #[must_use]
    pub fn schema(&self, id: &ResourceId) -> Option<&ResourceSchema> {
        self.entry(id).map(|entry| &entry.schema)
    }

    /// All registered schemas, sorted by pair.
    pub fn schemas(&self) -> impl Iterator<Item = &ResourceSchema> {
        self.entries.values().map(|entry| &entry.schema)
    }

    /// Returns true if the pair has a provider.
    #[must_use]
    pub fn supports(&self, id: &ResourceId) -> bool {
        self.entry(id).is_some()
    }
}
