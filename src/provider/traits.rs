//! The capability interface every provider/type pair implements.

use crate::config::{Attributes, ResourceId};
use crate::error::ProviderResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a provider reports back for a resource it owns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Provider-assigned id.
    pub provider_id: String,
    /// Attributes as the provider holds them.
    pub attributes: Attributes,
    /// Computed values the provider exposes (e.g. `arn`, `private_ip`).
    pub outputs: Attributes,
}

/// Create/read/update/delete for one `(provider, type)` pair.
///
/// Implementations classify their failures: network and timeout class
/// problems are `ProviderError::Transient`, everything else is fatal, and an
/// unknown provider id is `ProviderError::NotFound`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Creates the resource with fully resolved attributes.
    async fn create(&self, id: &ResourceId, attributes: &Attributes)
    -> ProviderResult<ProviderResponse>;

    /// Reads the current state of an existing resource.
    async fn read(&self, id: &ResourceId, provider_id: &str) -> ProviderResult<ProviderResponse>;

    /// Updates an existing resource in place.
    async fn update(
        &self,
        id: &ResourceId,
        provider_id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<ProviderResponse>;

    /// Deletes an existing resource.
    async fn delete(&self, id: &ResourceId, provider_id: &str) -> ProviderResult<()>;
}
