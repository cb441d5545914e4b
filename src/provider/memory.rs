//! In-memory provider with scripted failures.
//!
//! Used for dry runs and tests: it keeps resources in a map, records every
//! call as start/finish events, and can be told to fail specific resources
//! transiently or fatally.

use crate::config::{Attributes, ResourceId};
use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::traits::{ProviderResponse, ResourceProvider};

/// Provider operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// `create`
    Create,
    /// `read`
    Read,
    /// `update`
    Update,
    /// `delete`
    Delete,
}

/// One entry of the call log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// A call began.
    Started(Operation, ResourceId),
    /// A call returned successfully.
    Finished(Operation, ResourceId),
    /// A call returned an error.
    Failed(Operation, ResourceId),
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Transient,
    Fatal,
}

#[derive(Debug, Default)]
struct Inner {
    resources: HashMap<String, ProviderResponse>,
    failures: HashMap<ResourceId, VecDeque<Failure>>,
    events: Vec<ProviderEvent>,
}

/// In-memory provider.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    prefix: String,
    counter: AtomicU64,
    latency: Option<Duration>,
    inner: Mutex<Inner>,
}

impl MemoryProvider {
    /// Creates a provider whose ids look like `{prefix}-{n}`.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// Adds a fixed delay to every call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// The next `times` mutating calls for `id` fail transiently.
    pub async fn fail_transient(&self, id: &ResourceId, times: usize) {
        let mut inner = self.inner.lock().await;
        let queue = inner.failures.entry(id.clone()).or_default();
        queue.extend(std::iter::repeat_n(Failure::Transient, times));
    }

    /// The next mutating call for `id` fails fatally.
    pub async fn fail_fatal(&self, id: &ResourceId) {
        let mut inner = self.inner.lock().await;
        inner
            .failures
            .entry(id.clone())
            .or_default()
            .push_back(Failure::Fatal);
    }

    /// Removes a resource behind the engine's back.
    pub async fn forget(&self, provider_id: &str) {
        self.inner.lock().await.resources.remove(provider_id);
    }

    /// Changes an attribute behind the engine's back.
    pub async fn tamper(&self, provider_id: &str, key: &str, value: serde_json::Value) {
        if let Some(resource) = self.inner.lock().await.resources.get_mut(provider_id) {
            resource.attributes.insert(key.to_string(), value);
        }
    }

    /// Snapshot of the call log.
    pub async fn events(&self) -> Vec<ProviderEvent> {
        self.inner.lock().await.events.clone()
    }

    /// Number of calls of `op` made for `id`.
    pub async fn call_count(&self, op: Operation, id: &ResourceId) -> usize {
        self.inner
            .lock()
            .await
            .events
            .iter()
            .filter(|e| matches!(e, ProviderEvent::Started(o, i) if *o == op && i == id))
            .count()
    }

    /// Number of resources currently held.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.resources.len()
    }

    /// Returns true if no resources are held.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.resources.is_empty()
    }

    async fn begin(&self, op: Operation, id: &ResourceId) -> ProviderResult<()> {
        {
            let mut inner = self.inner.lock().await;
            inner.events.push(ProviderEvent::Started(op, id.clone()));
        }

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if op == Operation::Read {
            return Ok(());
        }

        let failure = self
            .inner
            .lock()
            .await
            .failures
            .get_mut(id)
            .and_then(VecDeque::pop_front);

        match failure {
            Some(Failure::Transient) => Err(ProviderError::transient(id.to_string(), "connection reset")),
            Some(Failure::Fatal) => Err(ProviderError::fatal(id.to_string(), "injected fatal failure")),
            None => Ok(()),
        }
    }

    async fn end<T>(&self, op: Operation, id: &ResourceId, result: ProviderResult<T>) -> ProviderResult<T> {
        let event = if result.is_ok() {
            ProviderEvent::Finished(op, id.clone())
        } else {
            ProviderEvent::Failed(op, id.clone())
        };
        self.inner.lock().await.events.push(event);
        result
    }

    fn not_found(id: &ResourceId, provider_id: &str) -> ProviderError {
        ProviderError::NotFound {
            resource: id.to_string(),
            provider_id: provider_id.to_string(),
        }
    }
}

#[async_trait]
impl ResourceProvider for MemoryProvider {
    async fn create(&self, id: &ResourceId, attributes: &Attributes) -> ProviderResult<ProviderResponse> {
        let result = match self.begin(Operation::Create, id).await {
            Ok(()) => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                let response = ProviderResponse {
                    provider_id: format!("{}-{n}", self.prefix),
                    attributes: attributes.clone(),
                    outputs: Attributes::new(),
                };
                self.inner
                    .lock()
                    .await
                    .resources
                    .insert(response.provider_id.clone(), response.clone());
                debug!("Memory provider created {id} as {}", response.provider_id);
                Ok(response)
            }
            Err(e) => Err(e),
        };
        self.end(Operation::Create, id, result).await
    }

    async fn read(&self, id: &ResourceId, provider_id: &str) -> ProviderResult<ProviderResponse> {
        let result = match self.begin(Operation::Read, id).await {
            Ok(()) => self
                .inner
                .lock()
                .await
                .resources
                .get(provider_id)
                .cloned()
                .ok_or_else(|| Self::not_found(id, provider_id)),
            Err(e) => Err(e),
        };
        self.end(Operation::Read, id, result).await
    }

    async fn update(
        &self,
        id: &ResourceId,
        provider_id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<ProviderResponse> {
        let result = match self.begin(Operation::Update, id).await {
            Ok(()) => {
                let mut inner = self.inner.lock().await;
                match inner.resources.get_mut(provider_id) {
                    Some(resource) => {
                        resource.attributes = attributes.clone();
                        Ok(resource.clone())
                    }
                    None => Err(Self::not_found(id, provider_id)),
                }
            }
            Err(e) => Err(e),
        };
        self.end(Operation::Update, id, result).await
    }

    async fn delete(&self, id: &ResourceId, provider_id: &str) -> ProviderResult<()> {
        let result = match self.begin(Operation::Delete, id).await {
            Ok(()) => self
                .inner
                .lock()
                .await
                .resources
                .remove(provider_id)
                .map(|_| ())
                .ok_or_else(|| Self::not_found(id, provider_id)),
            Err(e) => Err(e),
        };
        self.end(Operation::Delete, id, result).await
    }
}
