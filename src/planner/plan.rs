//! Plan types.
//!
//! A [`Plan`] is the ordered list of [`PlannedChange`]s the differ produces
//! and the executor consumes. Plans serialize to JSON so they can be saved
//! by `plan --out` and applied later; the recorded lineage and fingerprints
//! let the executor reject a plan whose state has moved on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{ResourceId, ResourceSpec};
use crate::error::{CirrusError, Result};
use crate::state::{Precondition, StateOperation};

/// A complete, ordered plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Whether applying the plan is an apply or a destroy.
    pub operation: StateOperation,
    /// Hash of the configuration the plan was made from.
    pub config_hash: String,
    /// Lineage of the state the plan was made against.
    pub lineage: String,
    /// Serial of the state the plan was made against.
    pub state_serial: u64,
    /// Changes in execution order.
    pub changes: Vec<PlannedChange>,
    /// Drift found by refresh, if refresh ran.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drift: Vec<DriftedResource>,
}

/// A single create/update/delete/no-op decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedChange {
    /// Resource identity.
    pub id: ResourceId,
    /// What will happen.
    pub action: ChangeAction,
    /// Attribute-level changes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diff: Vec<AttributeChange>,
    /// Declared spec, for create and update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<ResourceSpec>,
    /// Provider id of the existing resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_provider_id: Option<String>,
    /// Fingerprint of the record the change is based on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_fingerprint: Option<String>,
    /// Indices of changes that must succeed first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<usize>,
    /// Why the change was planned.
    #[serde(default)]
    pub reason: String,
}

/// Kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// Create a new resource.
    Create,
    /// Update an existing resource in place.
    Update,
    /// Delete a resource no longer declared.
    Delete,
    /// Nothing to do.
    NoOp,
}

/// Planned value of an attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum PlannedValue {
    /// Value known at plan time.
    Known(Value),
    /// Depends on a resource that does not exist yet.
    KnownAfterApply,
    /// Attribute will be removed.
    Absent,
}

/// Change of a single attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// Attribute key.
    pub key: String,
    /// Current value, if any.
    pub old: Option<Value>,
    /// Planned value.
    pub new: PlannedValue,
    /// Value came from a secret and must not be shown.
    #[serde(default)]
    pub sensitive: bool,
}

/// A resource whose provider-side state differs from its record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftedResource {
    /// Resource identity.
    pub id: ResourceId,
    /// Provider id from the record.
    pub provider_id: String,
    /// The provider no longer knows the resource.
    pub missing: bool,
    /// Attributes that differ: `old` is the record, `new` the provider.
    #[serde(default)]
    pub changes: Vec<AttributeChange>,
}

/// Per-action counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Creates.
    pub create: usize,
    /// Updates.
    pub update: usize,
    /// Deletes.
    pub delete: usize,
    /// No-ops.
    pub unchanged: usize,
}

impl Plan {
    /// Creates an empty plan against a state.
    #[must_use]
    pub fn new(operation: StateOperation, config_hash: &str, lineage: &str, serial: u64) -> Self {
        Self {
            created_at: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            lineage: lineage.to_string(),
            state_serial: serial,
            changes: Vec::new(),
            drift: Vec::new(),
        }
    }

    /// Returns true if applying the plan would change anything.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.changes.iter().any(|c| c.action != ChangeAction::NoOp)
    }

    /// Counts changes by action.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let count = |action| self.changes.iter().filter(|c| c.action == action).count();
        PlanSummary {
            create: count(ChangeAction::Create),
            update: count(ChangeAction::Update),
            delete: count(ChangeAction::Delete),
            unchanged: count(ChangeAction::NoOp),
        }
    }

    /// Finds the change for an identity.
    #[must_use]
    pub fn change(&self, id: &ResourceId) -> Option<&PlannedChange> {
        self.changes.iter().find(|c| &c.id == id)
    }

    /// Serializes the plan for saving.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| CirrusError::internal(format!("Failed to serialize plan: {e}")))
    }

    /// Parses a saved plan.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a plan or its dependency
    /// indices are out of order.
    pub fn from_json(json: &str) -> Result<Self> {
        let plan: Self = serde_json::from_str(json)
            .map_err(|e| CirrusError::internal(format!("Failed to parse plan: {e}")))?;

        for (idx, change) in plan.changes.iter().enumerate() {
            if change.depends_on.iter().any(|&dep| dep >= idx) {
                return Err(CirrusError::internal(format!(
                    "Plan change {idx} ({}) depends on a later change",
                    change.id
                )));
            }
        }
        Ok(plan)
    }
}

impl PlannedChange {
    /// What the store must hold for this change to proceed.
    #[must_use]
    pub fn precondition(&self) -> Precondition<'_> {
        self.prior_fingerprint
            .as_deref()
            .map_or(Precondition::Absent, Precondition::Fingerprint)
    }

    /// Returns a human-readable description of the change.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action {
            ChangeAction::Create => format!("Create {}", self.id),
            ChangeAction::Update => format!("Update {}", self.id),
            ChangeAction::Delete => format!("Delete {}", self.id),
            ChangeAction::NoOp => format!("No change for {}", self.id),
        }
    }
}

impl AttributeChange {
    /// Returns true if the key is new.
    #[must_use]
    pub const fn is_added(&self) -> bool {
        self.old.is_none()
    }

    /// Returns true if the key goes away.
    #[must_use]
    pub const fn is_removed(&self) -> bool {
        matches!(self.new, PlannedValue::Absent)
    }
}

impl PlanSummary {
    /// Total number of mutating changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.create + self.update + self.delete
    }
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Known(v) => write!(f, "{v}"),
            Self::KnownAfterApply => write!(f, "(known after apply)"),
            Self::Absent => write!(f, "(removed)"),
        }
    }
}

impl std::fmt::Display for PlannedChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action, self.id)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.create, self.update, self.delete, self.unchanged
        )
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Plan ({}):", self.summary())?;
        for (i, change) in self.changes.iter().enumerate() {
            if change.action != ChangeAction::NoOp {
                writeln!(f, "  {i}. {change}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(name: &str, action: ChangeAction, depends_on: Vec<usize>) -> PlannedChange {
        PlannedChange {
            id: ResourceId::new("aws", "instance", name),
            action,
            diff: Vec::new(),
            spec: None,
            prior_provider_id: None,
            prior_fingerprint: None,
            depends_on,
            reason: String::new(),
        }
    }

    #[test]
    fn test_summary_counts() {
        let mut plan = Plan::new(StateOperation::Apply, "hash", "lineage", 3);
        plan.changes = vec![
            change("a", ChangeAction::Create, vec![]),
            change("b", ChangeAction::NoOp, vec![]),
            change("c", ChangeAction::Delete, vec![0]),
        ];

        let summary = plan.summary();
        assert_eq!(summary.create, 1);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.delete, 1);
        assert_eq!(summary.total_changes(), 2);
        assert!(plan.has_changes());
    }

    #[test]
    fn test_noop_only_plan_has_no_changes() {
        let mut plan = Plan::new(StateOperation::Apply, "hash", "lineage", 3);
        plan.changes = vec![change("a", ChangeAction::NoOp, vec![])];
        assert!(!plan.has_changes());
        assert_eq!(plan.to_string(), "No changes required");
    }

    #[test]
    fn test_precondition_follows_prior_fingerprint() {
        let mut c = change("a", ChangeAction::Create, vec![]);
        assert_eq!(c.precondition(), Precondition::Absent);
        c.prior_fingerprint = Some(String::from("abc"));
        assert_eq!(c.precondition(), Precondition::Fingerprint("abc"));
    }

    #[test]
    fn test_saved_plan_keeps_unknown_values() {
        let mut plan = Plan::new(StateOperation::Apply, "hash", "lineage", 0);
        let mut c = change("a", ChangeAction::Create, vec![]);
        c.diff.push(AttributeChange {
            key: String::from("owner"),
            old: None,
            new: PlannedValue::KnownAfterApply,
            sensitive: false,
        });
        c.diff.push(AttributeChange {
            key: String::from("ami"),
            old: None,
            new: PlannedValue::Known(json!("ami-1")),
            sensitive: false,
        });
        plan.changes.push(c);

        let loaded = Plan::from_json(&plan.to_json().expect("serialize")).expect("parse");
        assert_eq!(loaded.changes[0].diff, plan.changes[0].diff);
        assert_eq!(loaded.lineage, "lineage");
    }

    #[test]
    fn test_forward_dependency_is_rejected() {
        let mut plan = Plan::new(StateOperation::Apply, "hash", "lineage", 0);
        plan.changes = vec![change("a", ChangeAction::Create, vec![1])];
        let json = serde_json::to_string(&plan).expect("serialize");
        assert!(Plan::from_json(&json).is_err());
    }
}
