// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // All public items must be documented
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

//! # Keel
//!
//! A diff-based reconciliation engine: declare a module of resources, and
//! Keel computes what must change, orders the changes by dependency and
//! applies them in parallel, unwinding everything if an operation fails.
//!
//! ## Overview
//!
//! - **Planning**: every declared resource is read through its provider and
//!   compared with its declaration, yielding one diff per resource.
//! - **Ordering**: diffs are grouped into batches from explicit
//!   `depends_on` edges plus a swappable type precedence.
//! - **Execution**: batches run one after another; operations inside a
//!   batch run concurrently under a per-executor semaphore, each with its
//!   own timeout.
//! - **Rollback**: every applied change is journaled with a snapshot taken
//!   just before it, and unwound newest-first on failure.
//! - **Drift**: modules can be re-checked, once or on an interval, without
//!   changing anything.
//!
//! ## Modules
//!
//! - [`config`]: Engine settings, module parsing, validation and hashing
//! - [`model`]: Resources, modules and property values
//! - [`provider`]: Provider trait, registry and in-memory provider
//! - [`planner`]: Diffs, plans, dependency graph and parallel executor
//! - [`drift`]: Drift detection
//! - [`reconciler`]: Full plan and apply cycle
//! - [`events`]: Engine events and emitters
//! - [`telemetry`]: Logging setup
//!
//! ## Example
//!
//! ```yaml
//! name: web
//! version: "1.0.0"
//! resources:
//!   - type: package
//!     name: nginx
//!     properties:
//!       version: "1.24"
//!   - type: service
//!     name: nginx
//!     depends_on: [package.nginx]
//!     properties:
//!       enabled: true
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod drift;
pub mod error;
pub mod events;
pub mod model;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod telemetry;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ConfigHasher, EngineSettings, ModuleParser, ModuleValidator, SettingsParser};
pub use drift::{DriftDetector, DriftReport, DriftResult};
pub use error::{KeelError, Result};
pub use events::{ChannelEmitter, Event, EventEmitter, SharedEmitter, TracingEmitter};
pub use model::{Module, ObservedState, Properties, Resource, ResourceId, ResourceState, Value};
pub use planner::{
    Action, DependencyGraph, DiffApplier, DiffEngine, ExecutionPlan, ExecutionReport,
    ExecutorConfig, ParallelExecutor, Plan, Planner, ResourceDiff, TypePrecedence,
};
pub use provider::{MemoryProvider, Provider, ProviderRegistry, RegistryApplier};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use telemetry::init_tracing;
