// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code is flagged
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Cirrus
//!
//! A declarative, graph-parallel resource provisioning engine with
//! plan/apply semantics, driven from CI runners.
//!
//! ## Overview
//!
//! A stack file declares resources across providers (`aws`, `azurerm`,
//! `google`, ...). Cirrus:
//!
//! - Builds a dependency graph from `${provider.type.name.attr}` references
//! - Diffs the declared resources against the last applied state into a plan
//! - Applies the plan in graph order, in parallel where the graph allows,
//!   retrying transient provider failures
//! - Persists one fingerprinted record per resource, locally or in S3
//!
//! ## Architecture
//!
//! 1. **Graph**: [`graph::ResourceGraph`] validates references and rejects
//!    cycles
//! 2. **Plan**: [`planner::DiffEngine`] produces create/update/delete/no-op
//!    changes
//! 3. **Apply**: [`planner::PlanExecutor`] runs changes and commits each one
//!    to the [`state::StateStore`] only after its provider acknowledged it
//!
//! [`engine::Engine`] wraps these behind `plan` and `apply`.
//!
//! ## Modules
//!
//! - [`config`]: Stack file parsing, secrets and validation
//! - [`graph`]: Reference extraction and the dependency graph
//! - [`planner`]: Diffing, plans, retries and execution
//! - [`provider`]: Provider capability interface and built-in providers
//! - [`state`]: State records, the store and its backends (local, S3)
//! - [`engine`]: The plan/apply facade
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: web-stack
//!   environment: prod
//!
//! resources:
//!   - provider: aws
//!     type: instance
//!     name: web
//!     attributes:
//!       ami: ami-0abc
//!       instance_type: t3.micro
//!   - provider: aws
//!     type: s3_bucket
//!     name: assets
//!     attributes:
//!       bucket: web-assets
//!       owner: "${aws.instance.web.id}"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, ResourceId, ResourceSpec, StackConfig};
pub use engine::{DriftReport, Engine};
pub use error::{CirrusError, Result};
pub use graph::ResourceGraph;
pub use planner::{ApplyReport, ChangeAction, DiffEngine, Plan, PlanExecutor, PlannedChange};
pub use provider::{MemoryProvider, ProviderRegistry, ResourceProvider, SandboxProvider};
pub use state::{LocalStateStorage, S3StateStorage, StateRecord, StateStorage, StateStore};
