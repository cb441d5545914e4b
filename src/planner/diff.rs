//! Diff engine for comparing declared specs against stored state.
//!
//! References are resolved against the *projected* state: a dependency
//! being created is known only after apply, `id` is the stored provider id,
//! and other attributes come from the dependency's resolved declaration or,
//! failing that, its stored attributes and outputs.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};

use serde_json::Value;
use tracing::{debug, info};

use crate::config::{Attributes, ConfigHasher, ResourceId, ResourceSpec};
use crate::error::{CirrusError, ConflictError, Result, ValidationError};
use crate::graph::{
    ID_ATTRIBUTE, Reference, Resolution, ResourceGraph, references_in, resolve_attributes,
};
use crate::provider::{ProviderRegistry, ProviderResponse};
use crate::state::{StateOperation, StateRecord, StateSnapshot};

use super::plan::{
    AttributeChange, ChangeAction, DriftedResource, Plan, PlannedChange, PlannedValue,
};

/// What the provider reported for a record during refresh.
#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    /// The resource exists.
    Present(ProviderResponse),
    /// The provider no longer knows the resource.
    Missing,
}

/// Provider-side view of every record, keyed by identity.
pub type Refresh = BTreeMap<ResourceId, Observed>;

/// Engine for computing plans.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Configuration hasher.
    hasher: ConfigHasher,
}

/// Projected outcome of one declared resource, used to resolve references
/// of resources planned after it.
struct Projected<'a> {
    action: ChangeAction,
    resolved: Attributes,
    sensitive: BTreeSet<String>,
    unknown: HashSet<String>,
    record: Option<&'a StateRecord>,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Reads every record from its provider.
    ///
    /// # Errors
    ///
    /// Returns an error if a record's type has no provider, or a read fails
    /// for any reason other than "not found".
    pub async fn refresh(registry: &ProviderRegistry, snapshot: &StateSnapshot) -> Result<Refresh> {
        let mut refresh = Refresh::new();

        for record in snapshot.records.values() {
            let provider = registry.get(&record.id)?;
            let observed = match provider.read(&record.id, &record.provider_id).await {
                Ok(response) => Observed::Present(response),
                Err(e) if e.is_not_found() => {
                    info!("{} ({}) no longer exists", record.id, record.provider_id);
                    Observed::Missing
                }
                Err(e) => return Err(e.into()),
            };
            refresh.insert(record.id.clone(), observed);
        }

        Ok(refresh)
    }

    /// Compares records against what the provider reported.
    #[must_use]
    pub fn detect_drift(snapshot: &StateSnapshot, refresh: &Refresh) -> Vec<DriftedResource> {
        snapshot
            .records
            .values()
            .filter_map(|record| {
                let drifted = match refresh.get(&record.id)? {
                    Observed::Missing => DriftedResource {
                        id: record.id.clone(),
                        provider_id: record.provider_id.clone(),
                        missing: true,
                        changes: Vec::new(),
                    },
                    Observed::Present(response) => {
                        let changes = attribute_changes(
                            &record.attributes,
                            &response.attributes,
                            &HashSet::new(),
                            |key| record.sensitive.contains(key),
                        );
                        if changes.is_empty() {
                            return None;
                        }
                        DriftedResource {
                            id: record.id.clone(),
                            provider_id: record.provider_id.clone(),
                            missing: false,
                            changes,
                        }
                    }
                };
                Some(drifted)
            })
            .collect()
    }

    /// Computes the plan that brings `snapshot` to the declared graph.
    ///
    /// With `refresh`, missing resources are planned as creates and drifted
    /// attributes are diffed against what the provider reported.
    ///
    /// # Errors
    ///
    /// Returns a conflict error if a stored record fails its fingerprint
    /// check, and a validation error if a reference names an attribute the
    /// dependency does not have.
    pub fn compute_plan(
        &self,
        graph: &ResourceGraph,
        snapshot: &StateSnapshot,
        refresh: Option<&Refresh>,
        config_hash: &str,
    ) -> Result<Plan> {
        verify_records(snapshot)?;

        let mut plan = Plan::new(
            StateOperation::Apply,
            config_hash,
            &snapshot.lineage,
            snapshot.serial,
        );
        if let Some(refresh) = refresh {
            plan.drift = Self::detect_drift(snapshot, refresh);
        }

        let mut projected: HashMap<ResourceId, Projected<'_>> = HashMap::new();
        let mut index_of: HashMap<ResourceId, usize> = HashMap::new();

        for spec in graph.topological_order() {
            let id = spec.id();
            let observed = refresh.and_then(|r| r.get(&id));
            let record = snapshot
                .get(&id)
                .filter(|_| !matches!(observed, Some(Observed::Missing)));

            let (resolved, unknown) =
                resolve_attributes(&id, &spec.attributes, &|reference: &Reference| {
                    resolve_projected(&projected, &id, reference)
                })?;
            let unknown: HashSet<String> = unknown.into_iter().collect();

            let mut spec = spec.clone();
            spec.sensitive
                .extend(inherited_sensitive(&id, &spec.attributes, &projected)?);

            let mut change = match record {
                None => Self::plan_create(&spec, &resolved, &unknown, snapshot.get(&id)),
                Some(record) => {
                    let current = match observed {
                        Some(Observed::Present(response)) => &response.attributes,
                        _ => &record.attributes,
                    };
                    Self::plan_existing(&spec, record, current, &resolved, &unknown)
                }
            };

            change.depends_on = graph
                .dependencies(&id)
                .into_iter()
                .filter_map(|dep| index_of.get(dep).copied())
                .collect();
            change.depends_on.sort_unstable();

            debug!("Planned {change}");
            index_of.insert(id.clone(), plan.changes.len());
            let mut sensitive = spec.sensitive;
            if let Some(record) = record {
                sensitive.extend(record.sensitive.iter().cloned());
            }
            projected.insert(
                id,
                Projected {
                    action: change.action,
                    resolved,
                    sensitive,
                    unknown,
                    record,
                },
            );
            plan.changes.push(change);
        }

        Self::append_deletes(&mut plan, graph, snapshot, &mut index_of);

        info!(
            "Plan for {}: {}",
            self.hasher.short_hash(config_hash),
            plan.summary()
        );
        Ok(plan)
    }

    /// Computes a plan that deletes every record.
    ///
    /// # Errors
    ///
    /// Returns a conflict error if a stored record fails its fingerprint
    /// check.
    pub fn compute_destroy(&self, snapshot: &StateSnapshot, config_hash: &str) -> Result<Plan> {
        verify_records(snapshot)?;

        let mut plan = Plan::new(
            StateOperation::Destroy,
            config_hash,
            &snapshot.lineage,
            snapshot.serial,
        );
        let graph = ResourceGraph::build(&[])?;
        Self::append_deletes(&mut plan, &graph, snapshot, &mut HashMap::new());

        info!(
            "Destroy plan for {}: {}",
            self.hasher.short_hash(config_hash),
            plan.summary()
        );
        Ok(plan)
    }

    fn plan_create(
        spec: &ResourceSpec,
        resolved: &Attributes,
        unknown: &HashSet<String>,
        stale: Option<&StateRecord>,
    ) -> PlannedChange {
        let diff = spec
            .attributes
            .keys()
            .map(|key| AttributeChange {
                key: key.clone(),
                old: None,
                new: planned_value(key, resolved, unknown),
                sensitive: spec.is_sensitive(key),
            })
            .collect();

        let reason = if stale.is_some() {
            String::from("resource no longer exists at the provider")
        } else {
            String::from("declared but not in state")
        };

        PlannedChange {
            id: spec.id(),
            action: ChangeAction::Create,
            diff,
            spec: Some(spec.clone()),
            prior_provider_id: None,
            prior_fingerprint: stale.map(|r| r.fingerprint.clone()),
            depends_on: Vec::new(),
            reason,
        }
    }

    fn plan_existing(
        spec: &ResourceSpec,
        record: &StateRecord,
        current: &Attributes,
        resolved: &Attributes,
        unknown: &HashSet<String>,
    ) -> PlannedChange {
        let diff = attribute_changes(current, resolved, unknown, |key| {
            spec.is_sensitive(key) || record.sensitive.contains(key)
        });

        let (action, reason) = if diff.is_empty() {
            (ChangeAction::NoOp, String::new())
        } else {
            let keys: Vec<&str> = diff.iter().map(|c| c.key.as_str()).collect();
            (ChangeAction::Update, format!("changed: {}", keys.join(", ")))
        };

        PlannedChange {
            id: spec.id(),
            action,
            diff,
            spec: Some(spec.clone()),
            prior_provider_id: Some(record.provider_id.clone()),
            prior_fingerprint: Some(record.fingerprint.clone()),
            depends_on: Vec::new(),
            reason,
        }
    }

    /// Appends deletes for undeclared records: a record is deleted only after
    /// every record that depended on it has been changed or deleted.
    fn append_deletes(
        plan: &mut Plan,
        graph: &ResourceGraph,
        snapshot: &StateSnapshot,
        index_of: &mut HashMap<ResourceId, usize>,
    ) {
        let doomed: Vec<&StateRecord> = snapshot
            .records
            .values()
            .filter(|r| !graph.contains(&r.id))
            .collect();
        if doomed.is_empty() {
            return;
        }

        let position: HashMap<&ResourceId, usize> =
            doomed.iter().enumerate().map(|(i, r)| (&r.id, i)).collect();

        // dependents[i]: doomed records that depend on doomed record i.
        let mut dependents: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); doomed.len()];
        for (i, record) in doomed.iter().enumerate() {
            for dep in &record.dependencies {
                if let Some(&j) = position.get(dep) {
                    dependents[j].insert(i);
                }
            }
        }

        // Kahn's algorithm on the reversed edges, lowest position first.
        let mut remaining: Vec<usize> = dependents.iter().map(BTreeSet::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = remaining
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(doomed.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for dep in &doomed[i].dependencies {
                if let Some(&j) = position.get(dep) {
                    remaining[j] -= 1;
                    if remaining[j] == 0 {
                        ready.push(Reverse(j));
                    }
                }
            }
        }
        // Stored dependencies can only form a cycle if the state was edited
        // by hand; delete whatever is left in identity order.
        if order.len() < doomed.len() {
            let placed: HashSet<usize> = order.iter().copied().collect();
            order.extend((0..doomed.len()).filter(|i| !placed.contains(i)));
        }

        for i in order {
            let record = doomed[i];
            let mut depends_on: Vec<usize> = snapshot
                .records
                .values()
                .filter(|other| other.dependencies.contains(&record.id))
                .filter_map(|other| index_of.get(&other.id).copied())
                .collect();
            depends_on.sort_unstable();

            let change = PlannedChange {
                id: record.id.clone(),
                action: ChangeAction::Delete,
                diff: record
                    .attributes
                    .iter()
                    .map(|(key, value)| AttributeChange {
                        key: key.clone(),
                        old: Some(value.clone()),
                        new: PlannedValue::Absent,
                        sensitive: record.sensitive.contains(key),
                    })
                    .collect(),
                spec: None,
                prior_provider_id: Some(record.provider_id.clone()),
                prior_fingerprint: Some(record.fingerprint.clone()),
                depends_on,
                reason: String::from("no longer declared"),
            };
            debug!("Planned {change}");
            index_of.insert(record.id.clone(), plan.changes.len());
            plan.changes.push(change);
        }
    }
}

fn verify_records(snapshot: &StateSnapshot) -> Result<()> {
    for record in snapshot.records.values() {
        if !record.verify() {
            return Err(CirrusError::Conflict(ConflictError::FingerprintMismatch {
                resource: record.id.to_string(),
                expected: record.fingerprint.clone(),
                found: record.compute_fingerprint(),
            }));
        }
    }
    Ok(())
}

fn resolve_projected(
    projected: &HashMap<ResourceId, Projected<'_>>,
    owner: &ResourceId,
    reference: &Reference,
) -> Result<Resolution> {
    let Some(target) = projected.get(&reference.target) else {
        return Err(CirrusError::internal(format!(
            "{} was planned before its dependency {}",
            reference.expression, reference.target
        )));
    };

    if target.action == ChangeAction::Create {
        return Ok(Resolution::Unknown);
    }

    let root = reference.attribute.split('.').next().unwrap_or_default();
    if reference.attribute != ID_ATTRIBUTE {
        if let Some(value) = crate::graph::lookup_path(&target.resolved, &reference.attribute) {
            return Ok(Resolution::Known(value.clone()));
        }
        if target.unknown.contains(root) {
            return Ok(Resolution::Unknown);
        }
    }

    let stored = target
        .record
        .and_then(|record| record.attribute(&reference.attribute))
        .ok_or_else(|| {
            CirrusError::Validation(ValidationError::UnknownAttribute {
                resource: owner.to_string(),
                target: reference.target.to_string(),
                attribute: reference.attribute.clone(),
            })
        })?;

    // Outputs of a resource being updated are recomputed by its provider.
    if target.action == ChangeAction::Update && reference.attribute != ID_ATTRIBUTE {
        return Ok(Resolution::Unknown);
    }
    Ok(Resolution::Known(stored))
}

/// Keys of `attributes` that copy a sensitive attribute of a dependency.
fn inherited_sensitive(
    owner: &ResourceId,
    attributes: &Attributes,
    projected: &HashMap<ResourceId, Projected<'_>>,
) -> Result<BTreeSet<String>> {
    let mut keys = BTreeSet::new();
    for (key, value) in attributes {
        for reference in references_in(owner, value)? {
            let root = reference.attribute.split('.').next().unwrap_or_default();
            if projected
                .get(&reference.target)
                .is_some_and(|target| target.sensitive.contains(root))
            {
                debug!("{owner}.{key} copies sensitive {}", reference.expression);
                keys.insert(key.clone());
            }
        }
    }
    Ok(keys)
}

fn planned_value(key: &str, resolved: &Attributes, unknown: &HashSet<String>) -> PlannedValue {
    if unknown.contains(key) {
        return PlannedValue::KnownAfterApply;
    }
    resolved
        .get(key)
        .cloned()
        .map_or(PlannedValue::Absent, PlannedValue::Known)
}

/// Per-key changes from `old` to the resolved `new` map: added, removed and
/// changed keys, in key order. Unknown keys always count as changed.
fn attribute_changes<F>(
    old: &Attributes,
    new: &Attributes,
    unknown: &HashSet<String>,
    is_sensitive: F,
) -> Vec<AttributeChange>
where
    F: Fn(&str) -> bool,
{
    let keys: BTreeSet<&String> = old
        .keys()
        .chain(new.keys())
        .chain(unknown.iter())
        .collect();

    keys.into_iter()
        .filter_map(|key| {
            let before: Option<&Value> = old.get(key);
            let after = planned_value(key, new, unknown);
            let unchanged = match (&after, before) {
                (PlannedValue::Known(v), Some(b)) => v == b,
                (PlannedValue::Absent, None) => true,
                _ => false,
            };
            (!unchanged).then(|| AttributeChange {
                key: key.clone(),
                old: before.cloned(),
                new: after,
                sensitive: is_sensitive(key),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vm(name: &str) -> ResourceSpec {
        ResourceSpec::new("aws", "instance", name).with_attribute("ami", "ami-1")
    }

    fn bucket(name: &str, owner: &str) -> ResourceSpec {
        ResourceSpec::new("aws", "s3_bucket", name)
            .with_attribute("bucket", name)
            .with_attribute("owner", format!("${{aws.instance.{owner}.id}}"))
    }

    fn record_for(spec: &ResourceSpec, provider_id: &str, deps: Vec<ResourceId>) -> StateRecord {
        StateRecord::new(
            spec.id(),
            provider_id,
            spec.attributes.clone(),
            Attributes::new(),
            deps,
        )
    }

    fn plan(specs: &[ResourceSpec], snapshot: &StateSnapshot) -> Result<Plan> {
        let graph = ResourceGraph::build(specs)?;
        DiffEngine::new().compute_plan(&graph, snapshot, None, "hash")
    }

    fn actions(plan: &Plan) -> Vec<(String, ChangeAction)> {
        plan.changes
            .iter()
            .map(|c| (c.id.name.clone(), c.action))
            .collect()
    }

    #[test]
    fn test_fresh_plan_creates_in_dependency_order() {
        let specs = vec![bucket("assets", "web"), vm("web")];
        let plan = plan(&specs, &StateSnapshot::new("p", "dev")).expect("plan");

        assert_eq!(
            actions(&plan),
            vec![
                (String::from("web"), ChangeAction::Create),
                (String::from("assets"), ChangeAction::Create),
            ]
        );
        assert_eq!(plan.changes[1].depends_on, vec![0]);

        let owner = plan.changes[1]
            .diff
            .iter()
            .find(|c| c.key == "owner")
            .expect("owner diff");
        assert_eq!(owner.new, PlannedValue::KnownAfterApply);
    }

    #[test]
    fn test_applied_state_yields_noops() {
        let web = vm("web");
        let assets = bucket("assets", "web");

        let mut snapshot = StateSnapshot::new("p", "dev");
        let mut resolved = assets.attributes.clone();
        resolved.insert(String::from("owner"), json!("i-1"));
        snapshot
            .records
            .insert(web.id(), record_for(&web, "i-1", Vec::new()));
        snapshot.records.insert(
            assets.id(),
            StateRecord::new(assets.id(), "assets", resolved, Attributes::new(), vec![web.id()]),
        );

        let plan = plan(&[web, assets], &snapshot).expect("plan");
        assert!(!plan.has_changes());
        assert_eq!(plan.summary().unchanged, 2);
    }

    #[test]
    fn test_changed_attribute_yields_update_with_diff() {
        let old = vm("web");
        let mut snapshot = StateSnapshot::new("p", "dev");
        snapshot
            .records
            .insert(old.id(), record_for(&old, "i-1", Vec::new()));

        let new = vm("web")
            .with_attribute("ami", "ami-2")
            .with_attribute("monitoring", true);
        let plan = plan(&[new], &snapshot).expect("plan");

        let change = &plan.changes[0];
        assert_eq!(change.action, ChangeAction::Update);
        assert_eq!(change.prior_provider_id.as_deref(), Some("i-1"));
        assert_eq!(change.diff.len(), 2);
        assert_eq!(change.diff[0].key, "ami");
        assert_eq!(change.diff[0].old, Some(json!("ami-1")));
        assert!(change.diff[1].is_added());
    }

    #[test]
    fn test_undeclared_records_delete_dependents_first() {
        let web = vm("web");
        let assets = bucket("assets", "web");
        let mut snapshot = StateSnapshot::new("p", "dev");
        snapshot
            .records
            .insert(web.id(), record_for(&web, "i-1", Vec::new()));
        snapshot
            .records
            .insert(assets.id(), record_for(&assets, "assets", vec![web.id()]));

        let plan = plan(&[], &snapshot).expect("plan");
        assert_eq!(
            actions(&plan),
            vec![
                (String::from("assets"), ChangeAction::Delete),
                (String::from("web"), ChangeAction::Delete),
            ]
        );
        assert_eq!(plan.changes[1].depends_on, vec![0]);
    }

    #[test]
    fn test_delete_waits_for_dependent_update() {
        let web = vm("web");
        let assets = bucket("assets", "web");
        let mut snapshot = StateSnapshot::new("p", "dev");
        snapshot
            .records
            .insert(web.id(), record_for(&web, "i-1", Vec::new()));
        snapshot
            .records
            .insert(assets.id(), record_for(&assets, "assets", vec![web.id()]));

        let detached = ResourceSpec::new("aws", "s3_bucket", "assets").with_attribute("bucket", "assets");
        let plan = plan(&[detached], &snapshot).expect("plan");

        assert_eq!(
            actions(&plan),
            vec![
                (String::from("assets"), ChangeAction::Update),
                (String::from("web"), ChangeAction::Delete),
            ]
        );
        assert_eq!(plan.changes[1].depends_on, vec![0]);
    }

    #[test]
    fn test_tampered_record_is_a_conflict() {
        let web = vm("web");
        let mut rec = record_for(&web, "i-1", Vec::new());
        rec.provider_id = String::from("i-2");
        let mut snapshot = StateSnapshot::new("p", "dev");
        snapshot.records.insert(web.id(), rec);

        let result = plan(&[web], &snapshot);
        assert!(matches!(result, Err(CirrusError::Conflict(_))));
    }

    #[test]
    fn test_reference_to_unknown_attribute_is_rejected() {
        let web = vm("web");
        let mut snapshot = StateSnapshot::new("p", "dev");
        snapshot
            .records
            .insert(web.id(), record_for(&web, "i-1", Vec::new()));

        let reader = ResourceSpec::new("aws", "s3_bucket", "logs")
            .with_attribute("zone", "${aws.instance.web.availability_zone}");
        let result = plan(&[web, reader], &snapshot);
        assert!(matches!(
            result,
            Err(CirrusError::Validation(ValidationError::UnknownAttribute { .. }))
        ));
    }

    #[test]
    fn test_reference_sees_declared_value_of_updated_dependency() {
        let web = vm("web");
        let mut snapshot = StateSnapshot::new("p", "dev");
        snapshot
            .records
            .insert(web.id(), record_for(&web, "i-1", Vec::new()));

        let updated = vm("web").with_attribute("ami", "ami-9");
        let reader =
            ResourceSpec::new("aws", "s3_bucket", "logs").with_attribute("image", "${aws.instance.web.ami}");
        let plan = plan(&[updated, reader], &snapshot).expect("plan");

        let image = &plan.changes[1].diff[0];
        assert_eq!(image.new, PlannedValue::Known(json!("ami-9")));
    }

    #[test]
    fn test_output_of_updated_dependency_is_known_after_apply() {
        let web = vm("web").with_attribute("region", "us-east-1");
        let mut outputs = Attributes::new();
        outputs.insert(String::from("arn"), json!("arn:aws:ec2:us-east-1:1:instance/i-1"));
        let web_record = StateRecord::new(
            web.id(),
            "i-1",
            web.attributes.clone(),
            outputs,
            Vec::new(),
        );

        let assets = bucket("assets", "web").with_attribute("owner_arn", "${aws.instance.web.arn}");
        let mut resolved = assets.attributes.clone();
        resolved.insert(String::from("owner"), json!("i-1"));
        resolved.insert(
            String::from("owner_arn"),
            json!("arn:aws:ec2:us-east-1:1:instance/i-1"),
        );
        let mut snapshot = StateSnapshot::new("p", "dev");
        snapshot.records.insert(web.id(), web_record);
        snapshot.records.insert(
            assets.id(),
            StateRecord::new(assets.id(), "assets", resolved, Attributes::new(), vec![web.id()]),
        );

        let unchanged = plan(&[web.clone(), assets.clone()], &snapshot).expect("plan");
        assert!(!unchanged.has_changes());

        let moved = vm("web").with_attribute("region", "eu-west-1");
        let plan = plan(&[moved, assets], &snapshot).expect("plan");
        assert_eq!(
            actions(&plan),
            vec![
                (String::from("web"), ChangeAction::Update),
                (String::from("assets"), ChangeAction::Update),
            ]
        );
        let keys: Vec<(&str, &PlannedValue)> = plan.changes[1]
            .diff
            .iter()
            .map(|c| (c.key.as_str(), &c.new))
            .collect();
        assert_eq!(keys, vec![("owner_arn", &PlannedValue::KnownAfterApply)]);
    }

    #[test]
    fn test_reference_to_sensitive_attribute_is_sensitive() {
        let mut web = vm("web").with_attribute("admin_password", "hunter2");
        web.sensitive.insert(String::from("admin_password"));
        let reader = ResourceSpec::new("aws", "s3_bucket", "logs")
            .with_attribute("bucket", "logs")
            .with_attribute("token", "pw=${aws.instance.web.admin_password}");

        let plan = plan(&[web, reader], &StateSnapshot::new("p", "dev")).expect("plan");
        let change = &plan.changes[1];
        let token = change.diff.iter().find(|c| c.key == "token").expect("token");
        assert!(token.sensitive);
        assert!(change.diff.iter().any(|c| c.key == "bucket" && !c.sensitive));
        assert!(change.spec.as_ref().is_some_and(|s| s.is_sensitive("token")));
    }

    #[test]
    fn test_refresh_missing_resource_is_recreated() {
        let web = vm("web");
        let rec = record_for(&web, "i-1", Vec::new());
        let fingerprint = rec.fingerprint.clone();
        let mut snapshot = StateSnapshot::new("p", "dev");
        snapshot.records.insert(web.id(), rec);

        let mut refresh = Refresh::new();
        refresh.insert(web.id(), Observed::Missing);

        let graph = ResourceGraph::build(std::slice::from_ref(&web)).expect("graph");
        let plan = DiffEngine::new()
            .compute_plan(&graph, &snapshot, Some(&refresh), "hash")
            .expect("plan");

        assert_eq!(plan.changes[0].action, ChangeAction::Create);
        assert_eq!(plan.changes[0].prior_fingerprint, Some(fingerprint));
        assert!(plan.drift[0].missing);
    }

    #[test]
    fn test_refresh_drift_is_corrected() {
        let web = vm("web");
        let mut snapshot = StateSnapshot::new("p", "dev");
        snapshot
            .records
            .insert(web.id(), record_for(&web, "i-1", Vec::new()));

        let mut drifted = web.attributes.clone();
        drifted.insert(String::from("ami"), json!("ami-hacked"));
        let mut refresh = Refresh::new();
        refresh.insert(
            web.id(),
            Observed::Present(ProviderResponse {
                provider_id: String::from("i-1"),
                attributes: drifted,
                outputs: Attributes::new(),
            }),
        );

        let graph = ResourceGraph::build(std::slice::from_ref(&web)).expect("graph");
        let plan = DiffEngine::new()
            .compute_plan(&graph, &snapshot, Some(&refresh), "hash")
            .expect("plan");

        assert_eq!(plan.changes[0].action, ChangeAction::Update);
        assert_eq!(plan.drift.len(), 1);
        assert_eq!(plan.drift[0].changes[0].new, PlannedValue::Known(json!("ami-hacked")));
    }

    #[test]
    fn test_destroy_plan_deletes_everything() {
        let web = vm("web");
        let mut snapshot = StateSnapshot::new("p", "dev");
        snapshot
            .records
            .insert(web.id(), record_for(&web, "i-1", Vec::new()));

        let plan = DiffEngine::new()
            .compute_destroy(&snapshot, "hash")
            .expect("plan");
        assert_eq!(plan.operation, StateOperation::Destroy);
        assert_eq!(plan.summary().delete, 1);
    }
}
