//! Planning and execution of resource changes.
//!
//! This module compares declared and observed state, orders the resulting
//! diffs into dependency-respecting batches and executes them in parallel
//! with rollback on failure.

mod diff;
mod executor;
mod graph;
mod plan;
mod rollback;

pub use diff::{Action, DiffEngine, DiffError, DiffErrorKind, PropertyChange, ResourceDiff};
pub use executor::{
    DiffApplier, ExecutionPlan, ExecutionReport, ExecutorConfig, Outcome, OperationResult,
    ParallelExecutor, Phase, DEFAULT_MAX_CONCURRENCY, DEFAULT_OPERATION_TIMEOUT_SECS,
};
pub use graph::{batches, DefaultPrecedence, DependencyGraph, StaticPrecedence, TypePrecedence};
pub use plan::{Plan, PlanSummary, Planner};
pub use rollback::{RollbackEntry, RollbackJournal};
