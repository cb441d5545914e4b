//! Plan executor.
//!
//! Changes run as soon as every change they depend on has succeeded, with
//! at most `max_parallel` in flight. A failed change blocks everything that
//! depends on it and leaves unrelated branches running; nothing already
//! applied is rolled back. State is committed only after the provider has
//! acknowledged a change.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Attributes, ExecutionConfig, ResourceId};
use crate::error::{CirrusError, ConflictError, Result, ValidationError};
use crate::graph::{Reference, Resolution, extract_references, resolve_attributes};
use crate::provider::ProviderRegistry;
use crate::state::{HistoryEntry, StateRecord, StateStore};

use super::plan::{ChangeAction, Plan, PlannedChange};
use super::retry::RetryPolicy;

/// Executor for plans.
#[derive(Debug, Clone)]
pub struct PlanExecutor {
    registry: Arc<ProviderRegistry>,
    store: Arc<StateStore>,
    retry: RetryPolicy,
    max_parallel: usize,
    cancel: CancellationToken,
}

/// Outcome of a single change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChangeOutcome {
    /// The provider acknowledged the change and state was committed.
    Applied {
        /// Provider id after the change.
        provider_id: Option<String>,
    },
    /// No-op; nothing was called.
    Unchanged,
    /// The change failed.
    Failed {
        /// Error message.
        error: String,
    },
    /// A dependency failed, so the change never ran.
    Blocked {
        /// The failed resource.
        by: ResourceId,
    },
    /// Cancelled before it started.
    Cancelled,
}

/// Outcome of one change, attributed to its resource.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeReport {
    /// Resource identity.
    pub id: ResourceId,
    /// Planned action.
    pub action: ChangeAction,
    /// What happened.
    pub outcome: ChangeOutcome,
}

/// Result of executing a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// Outcomes in plan order.
    pub outcomes: Vec<ChangeReport>,
    /// Records held by the store afterwards.
    pub records: Vec<StateRecord>,
}

impl PlanExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<StateStore>,
        config: &ExecutionConfig,
    ) -> Self {
        Self {
            registry,
            store,
            retry: RetryPolicy::from_config(config),
            max_parallel: config.max_parallel.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `token` to stop scheduling new changes.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Executes a plan.
    ///
    /// # Errors
    ///
    /// Returns a conflict error, before any provider call, if the store no
    /// longer matches what the plan was made against. Returns a validation
    /// error if a planned type has no provider. Failures of individual
    /// changes are reported in the [`ApplyReport`], not as errors.
    pub async fn execute(&self, plan: &Plan) -> Result<ApplyReport> {
        self.precheck(plan).await?;
        info!("Executing plan with {} changes", plan.changes.len());

        let total = plan.changes.len();
        let mut outcomes: Vec<Option<ChangeOutcome>> = vec![None; total];
        let mut started = vec![false; total];
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut running: JoinSet<(usize, ChangeOutcome)> = JoinSet::new();
        let mut panicked: Option<String> = None;

        loop {
            if self.cancel.is_cancelled() || panicked.is_some() {
                for (idx, outcome) in outcomes.iter_mut().enumerate() {
                    if outcome.is_none() && !started[idx] {
                        *outcome = Some(ChangeOutcome::Cancelled);
                    }
                }
            } else {
                self.schedule(plan, &mut outcomes, &mut started, &semaphore, &mut running);
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                joined = running.join_next() => {
                    match joined {
                        Some(Ok((idx, outcome))) => outcomes[idx] = Some(outcome),
                        Some(Err(e)) => {
                            error!(
                                "Change task panicked, waiting for {} in-flight changes: {e}",
                                running.len()
                            );
                            panicked.get_or_insert_with(|| e.to_string());
                        }
                        None => {}
                    }
                }
                () = self.cancel.cancelled(), if !self.cancel.is_cancelled() => {
                    warn!("Cancellation requested, waiting for {} in-flight changes", running.len());
                }
            }
        }

        if let Some(message) = panicked {
            return Err(CirrusError::internal(format!("Change task failed: {message}")));
        }

        let outcomes: Vec<ChangeReport> = plan
            .changes
            .iter()
            .zip(outcomes)
            .map(|(change, outcome)| ChangeReport {
                id: change.id.clone(),
                action: change.action,
                outcome: outcome.unwrap_or(ChangeOutcome::Cancelled),
            })
            .collect();

        let report = ApplyReport {
            outcomes,
            records: self.store.records().await,
        };
        self.record_history(plan, &report).await?;

        info!("{report}");
        Ok(report)
    }

    /// Verifies the whole plan against the store before anything runs.
    async fn precheck(&self, plan: &Plan) -> Result<()> {
        let snapshot = self.store.snapshot().await;
        // A plan made before anything was ever saved has a lineage no store
        // remembers; it is still current while nothing has been saved.
        let never_saved = plan.state_serial == 0 && snapshot.serial == 0;
        if snapshot.lineage != plan.lineage && !never_saved {
            return Err(CirrusError::Conflict(ConflictError::LineageMismatch {
                expected: plan.lineage.clone(),
                found: snapshot.lineage,
            }));
        }
        if snapshot.serial != plan.state_serial {
            debug!(
                "State serial moved from {} to {}, checking fingerprints",
                plan.state_serial, snapshot.serial
            );
        }

        for change in &plan.changes {
            self.store.check(&change.id, change.precondition()).await?;
            if change.action != ChangeAction::NoOp {
                self.registry.get(&change.id)?;
            }
            if matches!(change.action, ChangeAction::Create | ChangeAction::Update)
                && change.spec.is_none()
            {
                return Err(CirrusError::internal(format!(
                    "Plan has no spec for {} of {}",
                    change.action, change.id
                )));
            }
        }
        Ok(())
    }

    /// Starts every change whose dependencies have all succeeded, and blocks
    /// every change with a failed dependency.
    fn schedule(
        &self,
        plan: &Plan,
        outcomes: &mut [Option<ChangeOutcome>],
        started: &mut [bool],
        semaphore: &Arc<Semaphore>,
        running: &mut JoinSet<(usize, ChangeOutcome)>,
    ) {
        for (idx, change) in plan.changes.iter().enumerate() {
            if started[idx] || outcomes[idx].is_some() {
                continue;
            }

            let mut ready = true;
            let mut cancelled = false;
            let mut blocked_by = None;
            for &dep in &change.depends_on {
                match &outcomes[dep] {
                    None => ready = false,
                    Some(ChangeOutcome::Applied { .. } | ChangeOutcome::Unchanged) => {}
                    Some(ChangeOutcome::Failed { .. }) => {
                        blocked_by = Some(plan.changes[dep].id.clone());
                    }
                    Some(ChangeOutcome::Blocked { by }) => blocked_by = Some(by.clone()),
                    Some(ChangeOutcome::Cancelled) => cancelled = true,
                }
                if cancelled || blocked_by.is_some() {
                    break;
                }
            }

            if cancelled {
                outcomes[idx] = Some(ChangeOutcome::Cancelled);
                continue;
            }
            if let Some(by) = blocked_by {
                warn!("{} is blocked by failed {by}", change.id);
                outcomes[idx] = Some(ChangeOutcome::Blocked { by });
                continue;
            }
            if !ready {
                continue;
            }

            if change.action == ChangeAction::NoOp {
                outcomes[idx] = Some(ChangeOutcome::Unchanged);
                continue;
            }

            let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
                return;
            };

            started[idx] = true;
            let executor = self.clone();
            let change = change.clone();
            running.spawn(async move {
                let outcome = executor.run_change(&change).await;
                drop(permit);
                (idx, outcome)
            });
        }
    }

    async fn run_change(&self, change: &PlannedChange) -> ChangeOutcome {
        info!("{}", change.description());
        let _guard = self.store.lock_identity(&change.id).await;

        let result = match change.action {
            ChangeAction::Create | ChangeAction::Update => self.apply_change(change).await,
            ChangeAction::Delete => self.delete_change(change).await,
            ChangeAction::NoOp => return ChangeOutcome::Unchanged,
        };

        match result {
            Ok(provider_id) => ChangeOutcome::Applied { provider_id },
            Err(e) => {
                error!("{} failed: {e}", change.id);
                ChangeOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn apply_change(&self, change: &PlannedChange) -> Result<Option<String>> {
        let id = &change.id;
        let spec = change
            .spec
            .as_ref()
            .ok_or_else(|| CirrusError::internal(format!("No spec for {id}")))?;

        self.store.check(id, change.precondition()).await?;

        // References resolve from committed records only.
        let references = extract_references(id, &spec.attributes)?;
        let mut committed: HashMap<ResourceId, StateRecord> = HashMap::new();
        let mut dependencies = BTreeSet::new();
        for reference in &references {
            if !committed.contains_key(&reference.target)
                && let Some(record) = self.store.get(&reference.target).await
            {
                committed.insert(reference.target.clone(), record);
            }
            dependencies.insert(reference.target.clone());
        }
        let (attributes, unknown) =
            resolve_attributes(id, &spec.attributes, &|reference: &Reference| {
                resolve_committed(&committed, id, reference)
            })?;
        if let Some(key) = unknown.first() {
            return Err(CirrusError::internal(format!(
                "{id}.{key} is still unknown at apply time"
            )));
        }

        let provider = self.registry.get(id)?;
        let response = match (change.action, change.prior_provider_id.as_deref()) {
            (ChangeAction::Update, Some(provider_id)) => {
                self.retry
                    .run(id, || provider.update(id, provider_id, &attributes))
                    .await?
            }
            _ => self.retry.run(id, || provider.create(id, &attributes)).await?,
        };

        let provider_id = response.provider_id.clone();
        let record = StateRecord::new(
            id.clone(),
            response.provider_id,
            attributes,
            response.outputs,
            dependencies.into_iter().collect(),
        )
        .with_sensitive(spec.sensitive.clone());

        self.store
            .put(record, change.precondition())
            .await
            .inspect_err(|_| {
                error!("{id} was applied as {provider_id} but its state could not be committed");
            })?;

        info!("{} {id} ({provider_id})", past_tense(change.action));
        Ok(Some(provider_id))
    }

    async fn delete_change(&self, change: &PlannedChange) -> Result<Option<String>> {
        let id = &change.id;
        self.store.check(id, change.precondition()).await?;

        let provider_id = match &change.prior_provider_id {
            Some(provider_id) => provider_id.clone(),
            None => match self.store.get(id).await {
                Some(record) => record.provider_id,
                None => {
                    debug!("{id} has no record, nothing to delete");
                    return Ok(None);
                }
            },
        };

        let provider = self.registry.get(id)?;
        match self
            .retry
            .run(id, || provider.delete(id, &provider_id))
            .await
        {
            Ok(()) => info!("Deleted {id} ({provider_id})"),
            Err(e) if e.is_not_found() => info!("{id} ({provider_id}) was already gone"),
            Err(e) => return Err(e.into()),
        }

        self.store.delete(id, change.precondition()).await?;
        Ok(None)
    }

    async fn record_history(&self, plan: &Plan, report: &ApplyReport) -> Result<()> {
        let changed: Vec<String> = report
            .outcomes
            .iter()
            .filter(|r| r.action != ChangeAction::NoOp)
            .map(|r| r.id.to_string())
            .collect();

        let entry = if report.is_success() {
            HistoryEntry::new(plan.operation, &plan.config_hash, changed)
        } else {
            HistoryEntry::failed(
                plan.operation,
                &plan.config_hash,
                changed,
                &format!(
                    "{} failed, {} blocked, {} cancelled",
                    report.failed(),
                    report.blocked(),
                    report.cancelled()
                ),
            )
        };
        self.store.record_history(entry).await
    }
}

fn resolve_committed(
    committed: &HashMap<ResourceId, StateRecord>,
    owner: &ResourceId,
    reference: &Reference,
) -> Result<Resolution> {
    committed
        .get(&reference.target)
        .and_then(|record| record.attribute(&reference.attribute))
        .map(Resolution::Known)
        .ok_or_else(|| {
            CirrusError::Validation(ValidationError::UnknownAttribute {
                resource: owner.to_string(),
                target: reference.target.to_string(),
                attribute: reference.attribute.clone(),
            })
        })
}

const fn past_tense(action: ChangeAction) -> &'static str {
    match action {
        ChangeAction::Create => "Created",
        ChangeAction::Update => "Updated",
        ChangeAction::Delete => "Deleted",
        ChangeAction::NoOp => "Kept",
    }
}

impl ApplyReport {
    fn count(&self, pred: impl Fn(&ChangeOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|r| pred(&r.outcome)).count()
    }

    /// Number of applied changes.
    #[must_use]
    pub fn applied(&self) -> usize {
        self.count(|o| matches!(o, ChangeOutcome::Applied { .. }))
    }

    /// Number of unchanged resources.
    #[must_use]
    pub fn unchanged(&self) -> usize {
        self.count(|o| matches!(o, ChangeOutcome::Unchanged))
    }

    /// Number of failed changes.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ChangeOutcome::Failed { .. }))
    }

    /// Number of blocked changes.
    #[must_use]
    pub fn blocked(&self) -> usize {
        self.count(|o| matches!(o, ChangeOutcome::Blocked { .. }))
    }

    /// Number of cancelled changes.
    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.count(|o| matches!(o, ChangeOutcome::Cancelled))
    }

    /// Returns true if every change was applied or unchanged.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.blocked() == 0 && self.cancelled() == 0
    }

    /// Outcome for an identity.
    #[must_use]
    pub fn outcome(&self, id: &ResourceId) -> Option<&ChangeOutcome> {
        self.outcomes
            .iter()
            .find(|r| &r.id == id)
            .map(|r| &r.outcome)
    }

    /// Record for an identity.
    #[must_use]
    pub fn record(&self, id: &ResourceId) -> Option<&StateRecord> {
        self.records.iter().find(|r| &r.id == id)
    }
}

impl std::fmt::Display for ChangeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Applied { .. } => write!(f, "applied"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Failed { error } => write!(f, "failed: {error}"),
            Self::Blocked { by } => write!(f, "blocked by {by}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Apply finished: {} applied, {} unchanged, {} failed, {} blocked, {} cancelled",
            self.applied(),
            self.unchanged(),
            self.failed(),
            self.blocked(),
            self.cancelled()
        )
    }
}
