//! Engine facade.
//!
//! [`Engine`] ties a validated stack configuration to a provider registry
//! and a state store. Its boundary is `plan` (declared specs and prior state
//! to an ordered list of changes) and `apply` (that list to updated records
//! or a partial-failure report), plus drift detection and destroy planning.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigHasher, ConfigValidator, ResourceId, StackConfig, ValidationResult};
use crate::error::{CirrusError, Result, StateError};
use crate::graph::ResourceGraph;
use crate::planner::{ApplyReport, DiffEngine, DriftedResource, Plan, PlanExecutor, Refresh};
use crate::provider::ProviderRegistry;
use crate::state::{
    HistoryEntry, Precondition, StateOperation, StateRecord, StateStore, with_state_lock,
};

/// Planning and apply entry point for one stack.
#[derive(Debug)]
pub struct Engine {
    config: StackConfig,
    graph: ResourceGraph,
    registry: Arc<ProviderRegistry>,
    store: Arc<StateStore>,
    hasher: ConfigHasher,
    diff_engine: DiffEngine,
    config_hash: String,
    validation: ValidationResult,
    cancel: CancellationToken,
}

/// Result of comparing records with their providers.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// Number of records checked.
    pub checked: usize,
    /// Records that drifted or disappeared.
    pub drifted: Vec<DriftedResource>,
}

impl Engine {
    /// Validates the configuration and builds its resource graph.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for structural problems and a
    /// validation error for duplicate, dangling or cyclic references.
    pub fn new(
        config: StackConfig,
        registry: Arc<ProviderRegistry>,
        store: Arc<StateStore>,
    ) -> Result<Self> {
        let validation = ConfigValidator::with_registry(&registry).validate(&config)?;
        for warning in &validation.warnings {
            warn!("{warning}");
        }

        let graph = ResourceGraph::build(&config.resources)?;
        let hasher = ConfigHasher::new();
        let config_hash = hasher.hash_config(&config);
        debug!(
            "Built graph of {} resources for {} (config {})",
            graph.len(),
            config.qualified_name(),
            hasher.short_hash(&config_hash)
        );

        Ok(Self {
            config,
            graph,
            registry,
            store,
            hasher,
            diff_engine: DiffEngine::new(),
            config_hash,
            validation,
            cancel: CancellationToken::new(),
        })
    }

    /// Uses `token` to cancel in-flight applies.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The stack configuration.
    #[must_use]
    pub const fn config(&self) -> &StackConfig {
        &self.config
    }

    /// The resource graph.
    #[must_use]
    pub const fn graph(&self) -> &ResourceGraph {
        &self.graph
    }

    /// The state store.
    #[must_use]
    pub const fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Warnings found while validating the configuration.
    #[must_use]
    pub fn warnings(&self) -> &[String] {
        &self.validation.warnings
    }

    /// Hash of the configuration.
    #[must_use]
    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    /// Plans the changes that bring state to the declared configuration.
    ///
    /// With `refresh`, every record is read from its provider first.
    ///
    /// # Errors
    ///
    /// Returns a conflict error if a stored record fails its fingerprint
    /// check, a validation error for references to unknown attributes, and
    /// provider errors from refresh.
    pub async fn plan(&self, refresh: bool) -> Result<Plan> {
        info!(
            "Planning {} (config {})",
            self.config.qualified_name(),
            self.hasher.short_hash(&self.config_hash)
        );

        let snapshot = self.store.snapshot().await;
        let refreshed = if refresh {
            Some(DiffEngine::refresh(&self.registry, &snapshot).await?)
        } else {
            None
        };

        self.diff_engine
            .compute_plan(&self.graph, &snapshot, refreshed.as_ref(), &self.config_hash)
    }

    /// Plans the deletion of every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns a conflict error if a stored record fails its fingerprint
    /// check.
    pub async fn plan_destroy(&self) -> Result<Plan> {
        info!("Planning destroy of {}", self.config.qualified_name());
        let snapshot = self.store.snapshot().await;
        self.diff_engine.compute_destroy(&snapshot, &self.config_hash)
    }

    /// Applies a plan.
    ///
    /// # Errors
    ///
    /// Returns a conflict error, before any provider call, if the plan is
    /// stale. Individual change failures are reported in the returned
    /// [`ApplyReport`].
    pub async fn apply(&self, plan: &Plan) -> Result<ApplyReport> {
        if plan.config_hash != self.config_hash {
            warn!(
                "Plan was made from config {}, current config is {}",
                self.hasher.short_hash(&plan.config_hash),
                self.hasher.short_hash(&self.config_hash)
            );
        }

        PlanExecutor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            &self.config.execution,
        )
        .with_cancellation(self.cancel.clone())
        .execute(plan)
        .await
    }

    /// Applies a plan while holding the state lock, against state reloaded
    /// after the lock was taken.
    ///
    /// # Errors
    ///
    /// Returns a state error if the lock is held elsewhere or was lost, and
    /// the errors of [`Engine::apply`].
    pub async fn apply_locked(&self, plan: &Plan) -> Result<ApplyReport> {
        with_state_lock(self.store.storage().as_ref(), || async move {
            self.store.reload().await?;
            self.apply(plan).await
        })
        .await
    }

    /// Removes a record while holding the state lock.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Engine::remove_record`] and lock errors.
    pub async fn remove_record_locked(&self, id: &ResourceId) -> Result<StateRecord> {
        with_state_lock(self.store.storage().as_ref(), || async move {
            self.store.reload().await?;
            self.remove_record(id).await
        })
        .await
    }

    /// Reads every record from its provider.
    ///
    /// # Errors
    ///
    /// Returns provider errors other than "not found".
    pub async fn refresh(&self) -> Result<Refresh> {
        let snapshot = self.store.snapshot().await;
        DiffEngine::refresh(&self.registry, &snapshot).await
    }

    /// Compares every record with what its provider reports.
    ///
    /// # Errors
    ///
    /// Returns provider errors other than "not found".
    pub async fn check_drift(&self) -> Result<DriftReport> {
        let snapshot = self.store.snapshot().await;
        let refreshed = DiffEngine::refresh(&self.registry, &snapshot).await?;
        let drifted = DiffEngine::detect_drift(&snapshot, &refreshed);

        if drifted.is_empty() {
            info!("No drift across {} resources", snapshot.records.len());
        } else {
            warn!("{} of {} resources drifted", drifted.len(), snapshot.records.len());
        }

        Ok(DriftReport {
            checked: snapshot.records.len(),
            drifted,
        })
    }

    /// Drops a record from state without touching its provider.
    ///
    /// # Errors
    ///
    /// Returns an error if no record exists or the state cannot be written.
    pub async fn remove_record(&self, id: &ResourceId) -> Result<StateRecord> {
        let removed = self
            .store
            .delete(id, Precondition::Any)
            .await?
            .ok_or_else(|| {
                CirrusError::State(StateError::RecordNotFound {
                    resource: id.to_string(),
                })
            })?;

        self.store
            .record_history(HistoryEntry::new(
                StateOperation::Remove,
                &self.config_hash,
                vec![id.to_string()],
            ))
            .await?;

        warn!("Removed {id} from state; the resource itself was not deleted");
        Ok(removed)
    }
}

/// Process exit status of `drift` when something drifted.
pub const EXIT_DRIFT: u8 = 2;

impl DriftReport {
    /// Returns true if nothing drifted.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.drifted.is_empty()
    }

    /// Exit status for the report: 0 when clean, [`EXIT_DRIFT`] otherwise.
    #[must_use]
    pub fn exit_status(&self) -> u8 {
        if self.is_clean() { 0 } else { EXIT_DRIFT }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProjectConfig, ResourceSpec};
    use crate::planner::ChangeAction;
    use crate::provider::{MemoryProvider, ResourceProvider, ResourceSchema};
    use crate::state::LocalStateStorage;
    use serde_json::json;
    use tempfile::TempDir;

    fn stack(resources: Vec<ResourceSpec>) -> StackConfig {
        StackConfig {
            project: ProjectConfig {
                name: String::from("web-stack"),
                environment: String::from("dev"),
            },
            state: crate::config::StateConfig::default(),
            execution: crate::config::ExecutionConfig {
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                ..crate::config::ExecutionConfig::default()
            },
            sandbox: crate::config::SandboxConfig::default(),
            resources,
        }
    }

    fn specs() -> Vec<ResourceSpec> {
        vec![
            ResourceSpec::new("aws", "instance", "web").with_attribute("ami", "ami-1"),
            ResourceSpec::new("aws", "s3_bucket", "assets")
                .with_attribute("bucket", "assets")
                .with_attribute("owner", "${aws.instance.web.id}"),
        ]
    }

    async fn setup(dir: &TempDir) -> (Arc<StateStore>, Arc<ProviderRegistry>, Arc<MemoryProvider>) {
        let storage = Arc::new(LocalStateStorage::with_base_dir(dir.path()));
        let store = Arc::new(
            StateStore::open(storage, "web-stack", "dev")
                .await
                .expect("open store"),
        );
        let provider = Arc::new(MemoryProvider::new("res"));
        let mut registry = ProviderRegistry::new();
        registry.register(
            ResourceSchema::new("aws", "instance").with_required(&["ami"]),
            Arc::clone(&provider) as Arc<dyn ResourceProvider>,
        );
        registry.register(
            ResourceSchema::new("aws", "s3_bucket"),
            Arc::clone(&provider) as Arc<dyn ResourceProvider>,
        );
        (store, Arc::new(registry), provider)
    }

    #[tokio::test]
    async fn test_plan_apply_replan() {
        let dir = TempDir::new().expect("temp dir");
        let (store, registry, _) = setup(&dir).await;
        let engine = Engine::new(stack(specs()), registry, store).expect("engine");

        let plan = engine.plan(false).await.expect("plan");
        assert_eq!(plan.summary().create, 2);

        let report = engine.apply(&plan).await.expect("apply");
        assert!(report.is_success());
        let web = report
            .record(&ResourceId::new("aws", "instance", "web"))
            .expect("web record");
        let assets = report
            .record(&ResourceId::new("aws", "s3_bucket", "assets"))
            .expect("assets record");
        assert_eq!(assets.attributes["owner"], json!(web.provider_id));

        let again = engine.plan(false).await.expect("replan");
        assert!(!again.has_changes());
    }

    #[tokio::test]
    async fn test_missing_required_attribute_fails_validation() {
        let dir = TempDir::new().expect("temp dir");
        let (store, registry, _) = setup(&dir).await;
        let config = stack(vec![ResourceSpec::new("aws", "instance", "web")]);

        let result = Engine::new(config, registry, store);
        assert!(matches!(result, Err(CirrusError::Config(_))));
    }

    #[tokio::test]
    async fn test_cycle_is_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let (store, registry, _) = setup(&dir).await;
        let config = stack(vec![
            ResourceSpec::new("aws", "instance", "web")
                .with_attribute("ami", "${aws.s3_bucket.assets.bucket}"),
            ResourceSpec::new("aws", "s3_bucket", "assets").with_attribute("bucket", "${aws.instance.web.id}"),
        ]);

        let result = Engine::new(config, registry, store);
        assert!(matches!(result, Err(CirrusError::Validation(_))));
    }

    #[tokio::test]
    async fn test_drift_and_refresh_recreate() {
        let dir = TempDir::new().expect("temp dir");
        let (store, registry, provider) = setup(&dir).await;
        let engine = Engine::new(stack(specs()), registry, store).expect("engine");
        let plan = engine.plan(false).await.expect("plan");
        let report = engine.apply(&plan).await.expect("apply");

        let web = report
            .record(&ResourceId::new("aws", "instance", "web"))
            .expect("web")
            .clone();
        let assets = report
            .record(&ResourceId::new("aws", "s3_bucket", "assets"))
            .expect("assets")
            .clone();
        provider.forget(&web.provider_id).await;
        provider
            .tamper(&assets.provider_id, "bucket", json!("renamed"))
            .await;

        let drift = engine.check_drift().await.expect("drift");
        assert_eq!(drift.checked, 2);
        assert_eq!(drift.drifted.len(), 2);
        assert!(!drift.is_clean());

        let refreshed = engine.plan(true).await.expect("refresh plan");
        assert_eq!(refreshed.changes[0].action, ChangeAction::Create);
        assert_eq!(refreshed.changes[1].action, ChangeAction::Update);

        let report = engine.apply(&refreshed).await.expect("reapply");
        assert!(report.is_success());
        assert!(engine.check_drift().await.expect("drift").is_clean());
    }

    #[tokio::test]
    async fn test_destroy_removes_everything() {
        let dir = TempDir::new().expect("temp dir");
        let (store, registry, provider) = setup(&dir).await;
        let engine = Engine::new(stack(specs()), registry, store).expect("engine");
        let plan = engine.plan(false).await.expect("plan");
        engine.apply(&plan).await.expect("apply");

        let destroy = engine.plan_destroy().await.expect("destroy plan");
        assert_eq!(destroy.summary().delete, 2);
        assert_eq!(destroy.changes[0].id.name, "assets");

        let report = engine.apply(&destroy).await.expect("destroy");
        assert!(report.is_success());
        assert!(report.records.is_empty());
        assert!(provider.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_record_keeps_resource() {
        let dir = TempDir::new().expect("temp dir");
        let (store, registry, provider) = setup(&dir).await;
        let engine = Engine::new(stack(specs()), registry, store).expect("engine");
        let plan = engine.plan(false).await.expect("plan");
        engine.apply(&plan).await.expect("apply");

        let id = ResourceId::new("aws", "s3_bucket", "assets");
        engine.remove_record(&id).await.expect("remove");
        assert!(engine.store().get(&id).await.is_none());
        assert_eq!(provider.len().await, 2);

        let missing = engine.remove_record(&id).await;
        assert!(matches!(
            missing,
            Err(CirrusError::State(StateError::RecordNotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_first_apply_under_lock_on_new_stack() {
        let dir = TempDir::new().expect("temp dir");
        let (store, registry, _) = setup(&dir).await;
        let engine = Engine::new(stack(specs()), registry, store).expect("engine");

        let plan = engine.plan(false).await.expect("plan");
        let report = engine.apply_locked(&plan).await.expect("apply under lock");
        assert!(report.is_success());
        assert_eq!(report.applied(), 2);

        assert!(!engine.plan(false).await.expect("replan").has_changes());
        assert!(!engine.store().storage().is_locked().await.expect("is_locked"));
    }

    #[tokio::test]
    async fn test_saved_plan_applies_after_reopen() {
        let dir = TempDir::new().expect("temp dir");
        let saved = {
            let (store, registry, _) = setup(&dir).await;
            let engine = Engine::new(stack(specs()), registry, store).expect("engine");
            engine.plan(false).await.expect("plan").to_json().expect("save plan")
        };

        let (store, registry, provider) = setup(&dir).await;
        let engine = Engine::new(stack(specs()), registry, store).expect("engine");
        let plan = Plan::from_json(&saved).expect("load plan");
        let report = engine.apply_locked(&plan).await.expect("apply saved plan");
        assert!(report.is_success());
        assert_eq!(provider.len().await, 2);

        let mut changed = specs();
        changed[0] = ResourceSpec::new("aws", "instance", "web").with_attribute("ami", "ami-2");
        let engine = Engine::new(
            stack(changed),
            Arc::clone(&engine.registry),
            Arc::clone(engine.store()),
        )
        .expect("engine");
        let update_json = engine.plan(false).await.expect("plan").to_json().expect("save");
        let update = Plan::from_json(&update_json).expect("load");
        assert!(engine.apply_locked(&update).await.expect("update").is_success());

        let replayed = engine.apply_locked(&update).await;
        assert!(matches!(replayed, Err(CirrusError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_drift_exit_status() {
        let dir = TempDir::new().expect("temp dir");
        let (store, registry, provider) = setup(&dir).await;
        let engine = Engine::new(stack(specs()), registry, store).expect("engine");
        let report = engine
            .apply_locked(&engine.plan(false).await.expect("plan"))
            .await
            .expect("apply");
        assert_eq!(engine.check_drift().await.expect("drift").exit_status(), 0);

        let web = report
            .record(&ResourceId::new("aws", "instance", "web"))
            .expect("web");
        provider.tamper(&web.provider_id, "ami", json!("ami-other")).await;
        assert_eq!(
            engine.check_drift().await.expect("drift").exit_status(),
            EXIT_DRIFT
        );
    }

    #[tokio::test]
    async fn test_updated_outputs_flow_to_dependents() {
        let dir = TempDir::new().expect("temp dir");
        let storage = Arc::new(LocalStateStorage::with_base_dir(dir.path().join("state")));
        let store = Arc::new(
            StateStore::open(storage, "web-stack", "dev")
                .await
                .expect("open store"),
        );
        let registry = Arc::new(ProviderRegistry::sandbox(dir.path().join("sandbox")));
        let resources = |region: &str| {
            vec![
                ResourceSpec::new("aws", "instance", "web")
                    .with_attribute("ami", "ami-1")
                    .with_attribute("instance_type", "t3.micro")
                    .with_attribute("region", region),
                ResourceSpec::new("aws", "s3_bucket", "assets")
                    .with_attribute("bucket", "assets")
                    .with_attribute("owner_arn", "${aws.instance.web.arn}"),
            ]
        };

        let engine = Engine::new(
            stack(resources("us-east-1")),
            Arc::clone(&registry),
            Arc::clone(&store),
        )
        .expect("engine");
        let plan = engine.plan(false).await.expect("plan");
        assert!(engine.apply_locked(&plan).await.expect("apply").is_success());

        let engine = Engine::new(stack(resources("eu-west-1")), registry, Arc::clone(&store))
            .expect("engine");
        let plan = engine.plan(false).await.expect("plan");
        assert_eq!(plan.summary().update, 2);
        assert!(engine.apply_locked(&plan).await.expect("apply").is_success());

        assert!(!engine.plan(false).await.expect("replan").has_changes());
        let assets = store
            .get(&ResourceId::new("aws", "s3_bucket", "assets"))
            .await
            .expect("assets");
        assert!(assets.attributes["owner_arn"]
            .as_str()
            .is_some_and(|arn| arn.contains("eu-west-1")));
    }

    #[tokio::test]
    async fn test_remove_record_locked_releases_lock() {
        let dir = TempDir::new().expect("temp dir");
        let (store, registry, _) = setup(&dir).await;
        let engine = Engine::new(stack(specs()), registry, store).expect("engine");
        engine
            .apply_locked(&engine.plan(false).await.expect("plan"))
            .await
            .expect("apply");

        let id = ResourceId::new("aws", "s3_bucket", "assets");
        engine.remove_record_locked(&id).await.expect("remove");
        assert!(engine.store().get(&id).await.is_none());
        assert!(!engine.store().storage().is_locked().await.expect("is_locked"));
    }
}
