//! Error types for the Cirrus provisioning engine.
//!
//! This module provides the error hierarchy for every stage of the
//! provisioning lifecycle: configuration, graph validation, state
//! concurrency, provider calls, and state persistence.
//!
//! Every error that concerns a single resource carries that resource's
//! identity (`provider.type.name`) so failures are always attributable.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Cirrus engine.
#[derive(Debug, Error)]
pub enum CirrusError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Invalid resource graph (nothing is applied).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Stale or tampered state (apply aborted before mutation).
    #[error("State conflict: {0}")]
    Conflict(#[from] ConflictError),

    /// Provider call errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// State persistence errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The stack file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The stack file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Structural validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// A secret referenced by `${secret:NAME}` is not available.
    #[error("Secret '{name}' referenced by {resource} is not available")]
    MissingSecret {
        /// Name of the secret.
        name: String,
        /// Resource whose attributes reference the secret.
        resource: String,
    },
}

/// Errors raised while building or resolving the resource graph.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Two specs share the same identity.
    #[error("Duplicate resource: {resource}")]
    DuplicateResource {
        /// The duplicated identity.
        resource: String,
    },

    /// A reference points at a resource that is not declared.
    #[error("{resource} references undeclared resource {target} (in '{expression}')")]
    MissingReference {
        /// Resource holding the reference.
        resource: String,
        /// Identity that could not be found.
        target: String,
        /// The reference expression.
        expression: String,
    },

    /// A `${...}` expression could not be parsed.
    #[error("{resource} has a malformed reference '{expression}'")]
    MalformedReference {
        /// Resource holding the reference.
        resource: String,
        /// The reference expression.
        expression: String,
    },

    /// References form a cycle.
    #[error("Dependency cycle detected: {}", members.join(" -> "))]
    CyclicDependency {
        /// Cycle members in declaration order.
        members: Vec<String>,
    },

    /// A reference names an attribute the target does not expose.
    #[error("{resource} references unknown attribute '{attribute}' of {target}")]
    UnknownAttribute {
        /// Resource holding the reference.
        resource: String,
        /// Referenced resource.
        target: String,
        /// Missing attribute.
        attribute: String,
    },

    /// No provider is registered for the resource's provider/type pair.
    #[error("No provider registered for {provider}.{resource_type} (used by {resource})")]
    UnsupportedResourceType {
        /// Provider name.
        provider: String,
        /// Resource type.
        resource_type: String,
        /// Resource using the pair.
        resource: String,
    },
}

/// Optimistic concurrency errors.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// A stored record no longer matches the fingerprint the plan expects.
    #[error(
        "Conflicting concurrent state for {resource}: expected fingerprint {expected}, found {found}"
    )]
    FingerprintMismatch {
        /// Resource identity.
        resource: String,
        /// Fingerprint the caller expected.
        expected: String,
        /// Fingerprint actually found.
        found: String,
    },

    /// A saved plan was made against a different state lineage.
    #[error("Plan was made for state lineage {expected}, but the store holds {found}")]
    LineageMismatch {
        /// Lineage recorded in the plan.
        expected: String,
        /// Lineage of the current state.
        found: String,
    },
}

/// Provider errors, classified by retryability.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Network/timeout class failure, safe to retry.
    #[error("Transient provider error for {resource}: {message}")]
    Transient {
        /// Resource identity.
        resource: String,
        /// Description of the failure.
        message: String,
    },

    /// Non-retryable failure.
    #[error("Fatal provider error for {resource}: {message}")]
    Fatal {
        /// Resource identity.
        resource: String,
        /// Description of the failure.
        message: String,
    },

    /// The provider does not know the resource.
    #[error("{resource} not found at provider (id: {provider_id})")]
    NotFound {
        /// Resource identity.
        resource: String,
        /// Provider-assigned id that was looked up.
        provider_id: String,
    },

    /// Retries were exhausted for a transient failure.
    #[error("Maximum retry attempts ({attempts}) exceeded for {resource}: {message}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Resource identity.
        resource: String,
        /// Last transient failure.
        message: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State could not be written.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// The lock this process took is gone or held by someone else.
    #[error("State lock {lock_id} is no longer held (current holder: {holder})")]
    LockLost {
        /// The lock this process held.
        lock_id: String,
        /// Holder of the current lock, if any.
        holder: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },

    /// No record exists for the resource.
    #[error("No state record for {resource}")]
    RecordNotFound {
        /// Resource identity.
        resource: String,
    },
}

/// Result type alias for Cirrus operations.
pub type Result<T> = std::result::Result<T, CirrusError>;

/// Result type alias for provider operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

impl CirrusError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns the resource identity this error is attributed to, if any.
    #[must_use]
    pub fn resource(&self) -> Option<&str> {
        match self {
            Self::Validation(e) => e.resource(),
            Self::Conflict(ConflictError::FingerprintMismatch { resource, .. })
            | Self::State(StateError::RecordNotFound { resource })
            | Self::Config(ConfigError::MissingSecret { resource, .. }) => Some(resource),
            Self::Provider(e) => Some(e.resource()),
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl ValidationError {
    /// Returns the resource this error names first.
    #[must_use]
    pub fn resource(&self) -> Option<&str> {
        match self {
            Self::DuplicateResource { resource }
            | Self::MissingReference { resource, .. }
            | Self::MalformedReference { resource, .. }
            | Self::UnknownAttribute { resource, .. }
            | Self::UnsupportedResourceType { resource, .. } => Some(resource),
            Self::CyclicDependency { members } => members.first().map(String::as_str),
        }
    }
}

impl ProviderError {
    /// Creates a transient (retryable) error.
    #[must_use]
    pub fn transient(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Creates a fatal (non-retryable) error.
    #[must_use]
    pub fn fatal(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fatal {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Returns true if the call may succeed when repeated.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns true if the provider reported the resource as missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns the resource identity this error is attributed to.
    #[must_use]
    pub fn resource(&self) -> &str {
        match self {
            Self::Transient { resource, .. }
            | Self::Fatal { resource, .. }
            | Self::NotFound { resource, .. }
            | Self::RetriesExhausted { resource, .. } => resource,
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_is_retryable() {
        let err = CirrusError::from(ProviderError::transient("aws.instance.web", "timeout"));
        assert!(err.is_retryable());
        assert_eq!(err.resource(), Some("aws.instance.web"));
    }

    #[test]
    fn test_fatal_is_not_retryable() {
        let err = CirrusError::from(ProviderError::fatal("aws.instance.web", "quota"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_cycle_names_first_member() {
        let err = ValidationError::CyclicDependency {
            members: vec![String::from("aws.instance.a"), String::from("aws.instance.b")],
        };
        assert_eq!(err.resource(), Some("aws.instance.a"));
        assert!(err.to_string().contains("aws.instance.a -> aws.instance.b"));
    }
}
