//! State types for tracking applied resources.
//!
//! A [`StateSnapshot`] is the durable document a backend stores. It holds one
//! [`StateRecord`] per applied resource, keyed by identity, plus a bounded
//! history of apply runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::config::{Attributes, ConfigHasher, ResourceId};
use crate::graph::{ID_ATTRIBUTE, lookup_path};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum number of history entries kept.
pub const MAX_HISTORY: usize = 100;

/// The complete applied state of a stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Incremented on every persisted change.
    pub serial: u64,
    /// Identifies this state's lineage across serials.
    pub lineage: String,
    /// Hash of the last applied configuration.
    #[serde(default)]
    pub config_hash: String,
    /// Records keyed by resource identity.
    #[serde(default)]
    pub records: BTreeMap<ResourceId, StateRecord>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Apply history (recent entries).
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Last applied configuration of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Resource identity.
    pub id: ResourceId,
    /// Provider-assigned id.
    pub provider_id: String,
    /// Last-applied, fully resolved attributes.
    pub attributes: Attributes,
    /// Provider-computed outputs.
    #[serde(default)]
    pub outputs: Attributes,
    /// Identities this resource depended on when applied.
    #[serde(default)]
    pub dependencies: Vec<ResourceId>,
    /// Attribute keys holding secret values.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub sensitive: BTreeSet<String>,
    /// SHA-256 over identity, provider id and attributes.
    pub fingerprint: String,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

/// A single entry in the apply history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: StateOperation,
    /// Configuration hash at time of the run.
    pub config_hash: String,
    /// Resources changed.
    pub resources: Vec<String>,
    /// Whether every change succeeded.
    pub success: bool,
    /// Optional error summary.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of state-changing operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StateOperation {
    /// A plan was applied.
    Apply,
    /// All resources were destroyed.
    Destroy,
    /// A record was dropped from state without touching the provider.
    Remove,
}

impl StateSnapshot {
    /// Creates a new empty state with a fresh lineage.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            serial: 0,
            lineage: Uuid::new_v4().to_string(),
            config_hash: String::new(),
            records: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a record by identity.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&StateRecord> {
        self.records.get(id)
    }

    /// Adds a history entry, dropping the oldest past [`MAX_HISTORY`].
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Returns all resource identities.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<&ResourceId> {
        self.records.keys().collect()
    }
}

impl StateRecord {
    /// Creates a record and computes its fingerprint.
    #[must_use]
    pub fn new(
        id: ResourceId,
        provider_id: impl Into<String>,
        attributes: Attributes,
        outputs: Attributes,
        dependencies: Vec<ResourceId>,
    ) -> Self {
        let now = Utc::now();
        let mut record = Self {
            id,
            provider_id: provider_id.into(),
            attributes,
            outputs,
            dependencies,
            sensitive: BTreeSet::new(),
            fingerprint: String::new(),
            created_at: now,
            updated_at: now,
        };
        record.fingerprint = record.compute_fingerprint();
        record
    }

    /// Marks attribute keys as sensitive.
    #[must_use]
    pub fn with_sensitive(mut self, sensitive: BTreeSet<String>) -> Self {
        self.sensitive = sensitive;
        self
    }

    /// Recomputes the fingerprint from the record's content.
    #[must_use]
    pub fn compute_fingerprint(&self) -> String {
        ConfigHasher::new().fingerprint(&self.id, &self.provider_id, &self.attributes)
    }

    /// Returns true if the stored fingerprint matches the content.
    #[must_use]
    pub fn verify(&self) -> bool {
        ConfigHasher::hashes_match(&self.fingerprint, &self.compute_fingerprint())
    }

    /// Looks up a referenceable attribute: `id`, an attribute path, or an
    /// output path.
    #[must_use]
    pub fn attribute(&self, path: &str) -> Option<Value> {
        if path == ID_ATTRIBUTE {
            return Some(Value::String(self.provider_id.clone()));
        }
        lookup_path(&self.attributes, path)
            .or_else(|| lookup_path(&self.outputs, path))
            .cloned()
    }
}

impl HistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(operation: StateOperation, config_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: StateOperation,
        config_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::new(operation, config_hash, resources)
        }
    }
}

impl std::fmt::Display for StateOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Remove => "remove",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> StateRecord {
        let mut attributes = Attributes::new();
        attributes.insert(String::from("ami"), json!("ami-1"));
        attributes.insert(String::from("tags"), json!({"role": "web"}));
        let mut outputs = Attributes::new();
        outputs.insert(String::from("private_ip"), json!("10.0.0.5"));
        StateRecord::new(
            ResourceId::new("aws", "instance", "web"),
            "i-123",
            attributes,
            outputs,
            Vec::new(),
        )
    }

    #[test]
    fn test_record_fingerprint_verifies() {
        let mut rec = record();
        assert!(rec.verify());

        rec.provider_id = String::from("i-456");
        assert!(!rec.verify());
    }

    #[test]
    fn test_record_attribute_lookup() {
        let rec = record();
        assert_eq!(rec.attribute("id"), Some(json!("i-123")));
        assert_eq!(rec.attribute("tags.role"), Some(json!("web")));
        assert_eq!(rec.attribute("private_ip"), Some(json!("10.0.0.5")));
        assert_eq!(rec.attribute("nope"), None);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = StateSnapshot::new("proj", "dev");
        for i in 0..(MAX_HISTORY + 5) {
            state.add_history(HistoryEntry::new(
                StateOperation::Apply,
                &format!("hash-{i}"),
                Vec::new(),
            ));
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
        assert_eq!(state.history[0].config_hash, "hash-5");
    }

    #[test]
    fn test_snapshot_roundtrips_through_json() {
        let mut state = StateSnapshot::new("proj", "dev");
        let rec = record();
        state.records.insert(rec.id.clone(), rec.clone());

        let json = serde_json::to_string(&state).expect("should serialize");
        let back: StateSnapshot = serde_json::from_str(&json).expect("should parse");

        assert_eq!(back.get(&rec.id), Some(&rec));
        assert_eq!(back.lineage, state.lineage);
    }
}
