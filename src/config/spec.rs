//! Stack file types.
//!
//! This module defines the structs that map to the `cirrus.yaml` file.
//! A stack declares the desired set of resources; nothing here talks to a
//! provider or to the state backend.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Attribute map of a resource. Ordered so hashes and diffs are stable.
pub type Attributes = BTreeMap<String, Value>;

/// The root configuration structure for a Cirrus stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Executor tuning.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Sandbox provider configuration.
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Declared resources, in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Executor tuning knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Maximum number of changes applied concurrently.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Maximum retries for transient provider errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for a single backoff delay in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Sandbox provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SandboxConfig {
    /// Directory where simulated resources are stored.
    #[serde(default)]
    pub path: Option<String>,
}

/// Identity of a resource: `provider.type.name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    /// Provider name (e.g., "aws").
    pub provider: String,
    /// Resource type within the provider (e.g., "instance").
    pub resource_type: String,
    /// Logical name chosen by the user.
    pub name: String,
}

impl ResourceId {
    /// Creates a new resource identity.
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        resource_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// Parses an identity from its `provider.type.name` form.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the three segments is missing or empty.
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut parts = s.splitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(p), Some(t), Some(n)) if !p.is_empty() && !t.is_empty() && !n.is_empty() => {
                Ok(Self::new(p, t, n))
            }
            _ => Err(format!(
                "Invalid resource identity: {s}. Expected format: PROVIDER.TYPE.NAME"
            )),
        }
    }

    /// Returns the `(provider, type)` pair used for provider lookup.
    #[must_use]
    pub fn kind(&self) -> (&str, &str) {
        (&self.provider, &self.resource_type)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.provider, self.resource_type, self.name)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

/// Declared desired configuration for one infrastructure object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    /// Provider name.
    pub provider: String,
    /// Resource type within the provider.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Logical name, unique per provider/type.
    pub name: String,
    /// Declared attributes, possibly containing `${...}` references.
    #[serde(default)]
    pub attributes: Attributes,
    /// Attribute keys whose values came from a secret.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub sensitive: BTreeSet<String>,
}

impl ResourceSpec {
    /// Creates a spec with no attributes.
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        resource_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            resource_type: resource_type.into(),
            name: name.into(),
            attributes: Attributes::new(),
            sensitive: BTreeSet::new(),
        }
    }

    /// Adds an attribute (builder style).
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Returns the identity of this spec.
    #[must_use]
    pub fn id(&self) -> ResourceId {
        ResourceId::new(&self.provider, &self.resource_type, &self.name)
    }

    /// Returns true if the attribute must be redacted in output.
    #[must_use]
    pub fn is_sensitive(&self, key: &str) -> bool {
        self.sensitive.contains(key)
    }
}

impl StackConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns the identities of all declared resources.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<ResourceId> {
        self.resources.iter().map(ResourceSpec::id).collect()
    }
}

// Default value functions

const fn default_max_parallel() -> usize {
    10
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_environment() -> String {
    String::from("dev")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_parse() {
        let id = ResourceId::parse("aws.instance.web").expect("should parse");
        assert_eq!(id.provider, "aws");
        assert_eq!(id.resource_type, "instance");
        assert_eq!(id.name, "web");
        assert_eq!(id.to_string(), "aws.instance.web");
    }

    #[test]
    fn test_resource_id_invalid() {
        assert!(ResourceId::parse("aws.instance").is_err());
        assert!(ResourceId::parse("aws..web").is_err());
    }

    #[test]
    fn test_resource_id_as_map_key() {
        let mut map = BTreeMap::new();
        map.insert(ResourceId::new("aws", "instance", "web"), 1);
        let json = serde_json::to_string(&map).expect("should serialize");
        assert_eq!(json, r#"{"aws.instance.web":1}"#);
        let back: BTreeMap<ResourceId, i32> = serde_json::from_str(&json).expect("should parse");
        assert_eq!(back, map);
    }

    #[test]
    fn test_execution_defaults() {
        let exec = ExecutionConfig::default();
        assert_eq!(exec.max_parallel, 10);
        assert_eq!(exec.max_retries, 3);
    }
}
