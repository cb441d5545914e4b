//! Planning and execution.
//!
//! The [`DiffEngine`] compares declared specs with stored state and produces
//! a [`Plan`]; the [`PlanExecutor`] applies it against the providers and
//! commits results to the state store.

mod diff;
mod executor;
mod plan;
mod retry;

pub use diff::{DiffEngine, Observed, Refresh};
pub use executor::{ApplyReport, ChangeOutcome, ChangeReport, PlanExecutor};
pub use plan::{
    AttributeChange, ChangeAction, DriftedResource, Plan, PlanSummary, PlannedChange,
    PlannedValue,
};
pub use retry::RetryPolicy;
