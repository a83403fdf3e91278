//! Parallel executor for dependency-ordered plans.
//!
//! This module runs execution plans batch by batch. Operations inside a
//! batch run concurrently on tokio worker threads, bounded by a semaphore
//! owned by the executor. When an operation fails the executor can unwind
//! every change applied so far through the rollback journal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ExecuteError, OperationFailure, Result};
use crate::events::{emit_best_effort, noop, Event, SharedEmitter};
use crate::model::{ObservedState, ResourceId};

use super::diff::{Action, ResourceDiff};
use super::graph::{DefaultPrecedence, DependencyGraph, TypePrecedence};
use super::rollback::{RollbackEntry, RollbackJournal};

/// Default maximum number of concurrent operations.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Default per-operation timeout in seconds.
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 300;

/// Reads pre-change snapshots and applies diffs on behalf of the executor.
#[async_trait]
pub trait DiffApplier: Send + Sync {
    /// Reads the state of the diff's resource before it is changed.
    async fn read_snapshot(&self, ctx: &CancellationToken, diff: &ResourceDiff) -> Result<ObservedState>;

    /// Applies a diff.
    async fn apply(&self, ctx: &CancellationToken, diff: &ResourceDiff) -> Result<()>;
}

/// Executor settings, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Maximum operations running at once.
    pub max_concurrency: usize,
    /// Time allowed for a single operation.
    pub operation_timeout: Duration,
    /// Whether applied changes are unwound after a failure.
    pub rollback_enabled: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            operation_timeout: Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECS),
            rollback_enabled: true,
        }
    }
}

/// Dependency-ordered batches ready for execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    /// Unique id.
    pub id: Uuid,
    /// When the plan was built.
    pub created_at: DateTime<Utc>,
    /// Batches in execution order.
    pub batches: Vec<Vec<ResourceDiff>>,
    /// Actionable diffs left out because a dependency could not be planned.
    pub blocked: Vec<ResourceId>,
}

/// Whether an operation moved forward or unwound an earlier change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Applying the plan.
    Forward,
    /// Undoing an applied diff.
    Rollback,
}

/// How an operation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum Outcome {
    /// The operation succeeded.
    Succeeded,
    /// The operation returned an error.
    Failed(String),
    /// The operation exceeded its timeout.
    TimedOut,
    /// The operation was never started.
    Skipped,
}

/// Result of one attempted or skipped operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResult {
    /// Target resource.
    pub id: ResourceId,
    /// Action applied.
    pub action: Action,
    /// Forward or rollback.
    pub phase: Phase,
    /// How it ended.
    pub outcome: Outcome,
    /// Wall time spent.
    pub duration: Duration,
    /// Batch index, for forward operations.
    pub batch: Option<usize>,
    /// State captured before a successful forward operation.
    pub snapshot: Option<ObservedState>,
}

/// Every operation of a successful execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// Execution plan id.
    pub plan_id: Uuid,
    /// Operations in completion order.
    pub results: Vec<OperationResult>,
    /// Total wall time.
    pub duration: Duration,
}

/// Runs execution plans with bounded concurrency and rollback.
pub struct ParallelExecutor {
    /// Settings.
    config: ExecutorConfig,
    /// Bounds concurrent operations for this executor.
    semaphore: Arc<Semaphore>,
    /// Type ordering used when building execution plans.
    precedence: Arc<dyn TypePrecedence>,
    /// Event sink.
    emitter: SharedEmitter,
}

/// What a batch produced.
struct BatchRun {
    results: Vec<OperationResult>,
    cancelled: bool,
}

/// Everything a spawned operation needs.
struct OperationContext {
    ctx: CancellationToken,
    applier: Arc<dyn DiffApplier>,
    journal: Arc<Mutex<RollbackJournal>>,
    results: Arc<Mutex<Vec<OperationResult>>>,
    emitter: SharedEmitter,
    timeout: Duration,
    batch: usize,
}

impl ParallelExecutor {
    /// Creates an executor.
    ///
    /// # Errors
    ///
    /// Returns an error if the concurrency limit or the timeout is zero.
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        if config.max_concurrency == 0 {
            return Err(ExecuteError::InvalidConfig {
                message: String::from("max_concurrency must be at least 1"),
            }
            .into());
        }
        if config.operation_timeout.is_zero() {
            return Err(ExecuteError::InvalidConfig {
                message: String::from("operation_timeout must be greater than zero"),
            }
            .into());
        }

        Ok(Self {
            config,
            semaphore: Arc::new(Semaphore::new(config.max_concurrency)),
            precedence: Arc::new(DefaultPrecedence),
            emitter: noop(),
        })
    }

    /// Sets the type precedence used to order unrelated resources.
    #[must_use]
    pub fn with_precedence(mut self, precedence: Arc<dyn TypePrecedence>) -> Self {
        self.precedence = precedence;
        self
    }

    /// Sets the event emitter.
    #[must_use]
    pub fn with_emitter(mut self, emitter: SharedEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// The executor's settings.
    #[must_use]
    pub const fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Builds an execution plan from diffs.
    ///
    /// `NoOp` diffs and diffs that could not be computed are not scheduled.
    ///
    /// # Errors
    ///
    /// Returns an error if the dependencies form a cycle.
    pub fn create_execution_plan(&self, diffs: &[ResourceDiff]) -> Result<ExecutionPlan> {
        let graph = DependencyGraph::build(diffs, self.precedence.as_ref())?;

        if !graph.blocked().is_empty() {
            warn!(
                "{} resources blocked by dependencies that could not be planned",
                graph.blocked().len()
            );
        }

        Ok(ExecutionPlan {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            batches: graph.batches(),
            blocked: graph.blocked().to_vec(),
        })
    }

    /// Executes a plan, unwinding applied changes if an operation fails and
    /// rollback is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`ExecuteError::Failed`] if any operation failed, naming the
    /// failed operations and any rollback failures, even when `ctx` was
    /// cancelled in the same run. Returns [`ExecuteError::Cancelled`] if
    /// `ctx` was cancelled and nothing failed. Both carry every operation.
    pub async fn execute_with_rollback(
        &self,
        ctx: &CancellationToken,
        plan: &ExecutionPlan,
        applier: Arc<dyn DiffApplier>,
    ) -> Result<ExecutionReport> {
        let started = Instant::now();
        info!(
            "Executing plan {} ({} operations in {} batches)",
            plan.id,
            plan.operation_count(),
            plan.batches.len()
        );
        emit_best_effort(
            self.emitter.as_ref(),
            &Event::ApplyStarted {
                batches: plan.batches.len(),
                operations: plan.operation_count(),
            },
        );

        let journal = Arc::new(Mutex::new(RollbackJournal::new()));
        let mut results: Vec<OperationResult> = Vec::new();
        let mut failures: Vec<OperationFailure> = Vec::new();
        let mut cancelled = false;
        let mut next_batch = plan.batches.len();

        for (index, batch) in plan.batches.iter().enumerate() {
            if ctx.is_cancelled() {
                cancelled = true;
                next_batch = index;
                break;
            }

            debug!("Starting batch {index} ({} operations)", batch.len());
            let run = self.run_batch(ctx, index, batch, &applier, &journal).await;

            failures.extend(run.results.iter().filter_map(OperationResult::failure));
            results.extend(run.results);

            if run.cancelled {
                cancelled = true;
                next_batch = index + 1;
                break;
            }
            if !failures.is_empty() {
                error!("Batch {index} failed, skipping remaining batches");
                next_batch = index + 1;
                break;
            }
        }

        for (index, batch) in plan.batches.iter().enumerate().skip(next_batch) {
            results.extend(batch.iter().map(|diff| OperationResult::skipped(diff, index)));
        }

        let attempted = results
            .iter()
            .filter(|r| r.outcome != Outcome::Skipped)
            .count();

        if cancelled && failures.is_empty() {
            warn!("Execution of plan {} cancelled", plan.id);
            emit_best_effort(
                self.emitter.as_ref(),
                &Event::ApplyCompleted {
                    success: false,
                    attempted,
                },
            );
            return Err(ExecuteError::Cancelled { results }.into());
        }

        if failures.is_empty() {
            info!("Plan {} applied: {attempted} operations succeeded", plan.id);
            emit_best_effort(
                self.emitter.as_ref(),
                &Event::ApplyCompleted {
                    success: true,
                    attempted,
                },
            );
            return Ok(ExecutionReport {
                plan_id: plan.id,
                results,
                duration: started.elapsed(),
            });
        }

        if cancelled {
            warn!(
                "Execution of plan {} cancelled with {} failed operations",
                plan.id,
                failures.len()
            );
        }

        let mut rollback_failures = Vec::new();
        if self.config.rollback_enabled {
            let entries = journal.lock().await.drain_for_unwind();
            let rollback_results = self.rollback(entries, applier.as_ref()).await;
            rollback_failures.extend(rollback_results.iter().filter_map(OperationResult::failure));
            results.extend(rollback_results);
        } else {
            warn!("Rollback disabled, leaving applied changes in place");
        }

        emit_best_effort(
            self.emitter.as_ref(),
            &Event::ApplyCompleted {
                success: false,
                attempted,
            },
        );

        Err(ExecuteError::Failed {
            failures,
            rollback_failures,
            rolled_back: self.config.rollback_enabled,
            results,
        }
        .into())
    }

    /// Runs one batch to completion.
    async fn run_batch(
        &self,
        ctx: &CancellationToken,
        index: usize,
        batch: &[ResourceDiff],
        applier: &Arc<dyn DiffApplier>,
        journal: &Arc<Mutex<RollbackJournal>>,
    ) -> BatchRun {
        let shared_results = Arc::new(Mutex::new(Vec::with_capacity(batch.len())));
        let mut skipped = Vec::new();
        let mut dispatched = Vec::with_capacity(batch.len());
        let mut tasks = JoinSet::new();
        let mut cancelled = false;

        for diff in batch {
            if cancelled {
                skipped.push(OperationResult::skipped(diff, index));
                continue;
            }

            let permit = tokio::select! {
                biased;
                () = ctx.cancelled() => None,
                permit = Arc::clone(&self.semaphore).acquire_owned() => permit.ok(),
            };

            let Some(permit) = permit else {
                debug!("Dispatch stopped before {}", diff.id);
                cancelled = true;
                skipped.push(OperationResult::skipped(diff, index));
                continue;
            };

            let op = OperationContext {
                ctx: ctx.clone(),
                applier: Arc::clone(applier),
                journal: Arc::clone(journal),
                results: Arc::clone(&shared_results),
                emitter: Arc::clone(&self.emitter),
                timeout: self.config.operation_timeout,
                batch: index,
            };
            let diff = diff.clone();
            dispatched.push((diff.id.clone(), diff.action));

            tasks.spawn(async move {
                let _permit = permit;
                op.run(diff).await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Operation task in batch {index} aborted: {e}");
            }
        }

        let mut results = std::mem::take(&mut *shared_results.lock().await);

        // A task that panicked never recorded its result.
        for (id, action) in dispatched {
            if !results.iter().any(|r| r.id == id) {
                results.push(OperationResult {
                    id,
                    action,
                    phase: Phase::Forward,
                    outcome: Outcome::Failed(String::from("operation aborted")),
                    duration: Duration::ZERO,
                    batch: Some(index),
                    snapshot: None,
                });
            }
        }

        results.extend(skipped);
        BatchRun { results, cancelled }
    }

    /// Applies the inverse of each journal entry, newest first.
    ///
    /// The sweep runs under its own token so a cancelled caller still gets
    /// its failed changes unwound. Each inverse is bounded by the operation
    /// timeout.
    async fn rollback(&self, entries: Vec<RollbackEntry>, applier: &dyn DiffApplier) -> Vec<OperationResult> {
        info!("Rolling back {} applied operations", entries.len());
        let ctx = CancellationToken::new();
        let mut results = Vec::with_capacity(entries.len());

        for entry in entries {
            let inverse = entry.inverse();

            let started = Instant::now();
            let outcome = match tokio::time::timeout(
                self.config.operation_timeout,
                applier.apply(&ctx, &inverse),
            )
            .await
            {
                Ok(Ok(())) => Outcome::Succeeded,
                Ok(Err(e)) => Outcome::Failed(e.to_string()),
                Err(_) => Outcome::TimedOut,
            };

            let success = outcome == Outcome::Succeeded;
            if success {
                debug!("Rolled back {} ({})", inverse.id, inverse.action);
            } else {
                error!("Rollback of {} failed: {:?}", inverse.id, outcome);
            }
            emit_best_effort(
                self.emitter.as_ref(),
                &Event::ResourceRolledBack {
                    id: inverse.id.clone(),
                    action: inverse.action,
                    success,
                },
            );

            results.push(OperationResult {
                id: inverse.id,
                action: inverse.action,
                phase: Phase::Rollback,
                outcome,
                duration: started.elapsed(),
                batch: None,
                snapshot: None,
            });
        }

        results
    }
}

impl std::fmt::Debug for ParallelExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelExecutor")
            .field("config", &self.config)
            .field("precedence", &self.precedence)
            .finish_non_exhaustive()
    }
}

impl OperationContext {
    /// Snapshots, applies and records a single diff.
    async fn run(self, diff: ResourceDiff) {
        emit_best_effort(
            self.emitter.as_ref(),
            &Event::ResourceStarted {
                id: diff.id.clone(),
                action: diff.action,
            },
        );

        let started = Instant::now();
        let attempt = async {
            let snapshot = self.applier.read_snapshot(&self.ctx, &diff).await?;
            self.applier.apply(&self.ctx, &diff).await?;
            Ok::<_, crate::error::KeelError>(snapshot)
        };

        let (outcome, snapshot) = match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(snapshot)) => {
                // Recorded under the lock so the journal reflects completion order.
                self.journal
                    .lock()
                    .await
                    .record(diff.clone(), snapshot.clone());
                (Outcome::Succeeded, Some(snapshot))
            }
            Ok(Err(e)) => (Outcome::Failed(e.to_string()), None),
            Err(_) => (Outcome::TimedOut, None),
        };
        let duration = started.elapsed();

        match &outcome {
            Outcome::Succeeded => {
                debug!("{} {} succeeded in {duration:?}", diff.action, diff.id);
                emit_best_effort(
                    self.emitter.as_ref(),
                    &Event::ResourceCompleted {
                        id: diff.id.clone(),
                        action: diff.action,
                        duration,
                    },
                );
            }
            other => {
                let message = match other {
                    Outcome::Failed(message) => message.clone(),
                    _ => format!("timed out after {:?}", self.timeout),
                };
                error!("{} {} failed: {message}", diff.action, diff.id);
                emit_best_effort(
                    self.emitter.as_ref(),
                    &Event::ResourceFailed {
                        id: diff.id.clone(),
                        action: diff.action,
                        error: message,
                    },
                );
            }
        }

        self.results.lock().await.push(OperationResult {
            id: diff.id,
            action: diff.action,
            phase: Phase::Forward,
            outcome,
            duration,
            batch: Some(self.batch),
            snapshot,
        });
    }
}

impl ExecutionPlan {
    /// Number of scheduled operations.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    /// Returns true if nothing is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.iter().all(Vec::is_empty)
    }

    /// Ids of every scheduled diff, batch by batch.
    #[must_use]
    pub fn scheduled_ids(&self) -> Vec<ResourceId> {
        self.batches
            .iter()
            .flat_map(|batch| batch.iter().map(|d| d.id.clone()))
            .collect()
    }
}

impl OperationResult {
    /// A result for an operation that never started.
    #[must_use]
    pub fn skipped(diff: &ResourceDiff, batch: usize) -> Self {
        Self {
            id: diff.id.clone(),
            action: diff.action,
            phase: Phase::Forward,
            outcome: Outcome::Skipped,
            duration: Duration::ZERO,
            batch: Some(batch),
            snapshot: None,
        }
    }

    /// Returns true if the operation succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Succeeded
    }

    /// The failure record, if the operation failed or timed out.
    #[must_use]
    pub fn failure(&self) -> Option<OperationFailure> {
        match &self.outcome {
            Outcome::Failed(message) => Some(OperationFailure::new(self.id.clone(), self.action, message.clone())),
            Outcome::TimedOut => Some(OperationFailure::timed_out(self.id.clone(), self.action, self.duration)),
            Outcome::Succeeded | Outcome::Skipped => None,
        }
    }
}

impl ExecutionReport {
    /// Forward operations that succeeded.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.phase == Phase::Forward && r.is_success())
            .count()
    }

    /// Forward operations that failed or timed out.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.phase == Phase::Forward && r.failure().is_some())
            .count()
    }

    /// Rollback operations performed.
    #[must_use]
    pub fn rolled_back(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.phase == Phase::Rollback)
            .count()
    }

    /// Returns true if every operation succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.results.iter().all(OperationResult::is_success)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "ok"),
            Self::Failed(message) => write!(f, "failed: {message}"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::fmt::Display for OperationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self.phase {
            Phase::Forward => "",
            Phase::Rollback => "rollback ",
        };
        write!(f, "{phase}{} {}: {}", self.action, self.id, self.outcome)
    }
}

impl std::fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Executed {} operations in {:?}",
            self.succeeded(),
            self.duration
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeelError;
    use crate::model::{Properties, Resource, Value};
    use crate::planner::DiffEngine;
    use crate::provider::{MemoryProvider, Provider, ProviderRegistry, RegistryApplier};
    use std::collections::HashSet;

    fn create(resource_type: &str, name: &str) -> ResourceDiff {
        DiffEngine::new().compute(&Resource::new(resource_type, name), &ObservedState::absent())
    }

    fn applier(providers: Vec<Arc<MemoryProvider>>) -> Arc<dyn DiffApplier> {
        let mut registry = ProviderRegistry::new();
        for provider in providers {
            registry.register(provider as Arc<dyn Provider>).unwrap();
        }
        Arc::new(RegistryApplier::new(Arc::new(registry)))
    }

    fn executor(rollback_enabled: bool) -> ParallelExecutor {
        ParallelExecutor::new(ExecutorConfig {
            max_concurrency: 4,
            operation_timeout: Duration::from_secs(5),
            rollback_enabled,
        })
        .unwrap()
    }

    fn unwrap_failed(
        result: Result<ExecutionReport>,
    ) -> (Vec<OperationFailure>, Vec<OperationFailure>, Vec<OperationResult>, String) {
        let err = result.expect_err("expected failure");
        let message = err.to_string();
        let KeelError::Execute(ExecuteError::Failed {
            failures,
            rollback_failures,
            results,
            ..
        }) = err
        else {
            panic!("expected ExecuteError::Failed, got {message}");
        };
        (failures, rollback_failures, results, message)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let zero = ExecutorConfig {
            max_concurrency: 0,
            ..ExecutorConfig::default()
        };
        assert!(ParallelExecutor::new(zero).is_err());

        let no_timeout = ExecutorConfig {
            operation_timeout: Duration::ZERO,
            ..ExecutorConfig::default()
        };
        assert!(ParallelExecutor::new(no_timeout).is_err());
    }

    #[test]
    fn test_execution_plan_covers_every_diff_once() {
        let diffs = vec![
            create("pkg", "git"),
            DiffEngine::new().compute(
                &Resource::new("service", "sshd").depends_on(ResourceId::new("pkg", "git")),
                &ObservedState::absent(),
            ),
            create("file", "a"),
        ];

        let plan = executor(true).create_execution_plan(&diffs).unwrap();
        let ids = plan.scheduled_ids();
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(unique.len(), 3);
        assert_eq!(plan.batches[0][0].id, ResourceId::new("pkg", "git"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_successful_execution() {
        let files = Arc::new(MemoryProvider::new("file"));
        let exec = executor(true);
        let plan = exec
            .create_execution_plan(&[create("file", "a"), create("file", "b")])
            .unwrap();

        let report = exec
            .execute_with_rollback(&CancellationToken::new(), &plan, applier(vec![files.clone()]))
            .await
            .expect("execution failed");

        assert!(report.is_success());
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 0);
        assert_eq!(report.rolled_back(), 0);
        assert!(report.results.iter().all(|r| r.snapshot == Some(ObservedState::absent())));
        assert!(files.observe("a").await.present);
        assert!(files.observe("b").await.present);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_first_failure_rolls_back_nothing_and_skips_dependents() {
        let packages = Arc::new(MemoryProvider::new("pkg").fail_apply("git", Action::Create));
        let services = Arc::new(MemoryProvider::new("service"));
        let exec = executor(true);

        let diffs = vec![
            create("pkg", "git"),
            DiffEngine::new().compute(
                &Resource::new("service", "sshd").depends_on(ResourceId::new("pkg", "git")),
                &ObservedState::absent(),
            ),
        ];
        let plan = exec.create_execution_plan(&diffs).unwrap();
        assert_eq!(plan.batches.len(), 2);

        let result = exec
            .execute_with_rollback(
                &CancellationToken::new(),
                &plan,
                applier(vec![packages, services.clone()]),
            )
            .await;

        let (failures, rollback_failures, results, message) = unwrap_failed(result);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].id, ResourceId::new("pkg", "git"));
        assert!(rollback_failures.is_empty());
        assert!(message.contains("pkg.git"));
        assert!(results.iter().all(|r| r.phase == Phase::Forward));

        let sshd = results
            .iter()
            .find(|r| r.id == ResourceId::new("service", "sshd"))
            .unwrap();
        assert_eq!(sshd.outcome, Outcome::Skipped);
        assert_eq!(services.apply_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sibling_failure_rolls_back_completed_sibling() {
        let files = Arc::new(MemoryProvider::new("file").fail_apply("b", Action::Create));
        let exec = executor(true);
        let plan = exec
            .create_execution_plan(&[create("file", "a"), create("file", "b")])
            .unwrap();
        assert_eq!(plan.batches.len(), 1);

        let result = exec
            .execute_with_rollback(&CancellationToken::new(), &plan, applier(vec![files.clone()]))
            .await;

        let (failures, rollback_failures, results, message) = unwrap_failed(result);
        assert_eq!(failures[0].id, ResourceId::new("file", "b"));
        assert!(rollback_failures.is_empty());
        assert!(message.contains("file.b"));

        let rollbacks: Vec<&OperationResult> = results.iter().filter(|r| r.phase == Phase::Rollback).collect();
        assert_eq!(rollbacks.len(), 1);
        assert_eq!(rollbacks[0].id, ResourceId::new("file", "a"));
        assert_eq!(rollbacks[0].action, Action::Delete);
        assert!(rollbacks[0].is_success());

        // file.a was applied then unwound; file.b never landed.
        assert!(!files.observe("a").await.present);
        assert!(!files.observe("b").await.present);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rollback_failures_are_collected() {
        let files = Arc::new(
            MemoryProvider::new("file")
                .fail_apply("b", Action::Create)
                .fail_apply("a", Action::Delete),
        );
        let exec = executor(true);
        let plan = exec
            .create_execution_plan(&[create("file", "a"), create("file", "b")])
            .unwrap();

        let result = exec
            .execute_with_rollback(&CancellationToken::new(), &plan, applier(vec![files]))
            .await;

        let (failures, rollback_failures, _, message) = unwrap_failed(result);
        assert_eq!(failures.len(), 1);
        assert_eq!(rollback_failures.len(), 1);
        assert_eq!(rollback_failures[0].id, ResourceId::new("file", "a"));
        assert_eq!(rollback_failures[0].action, Action::Delete);
        assert!(message.contains("create file.b"));
        assert!(message.contains("delete file.a"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rollback_reverses_completion_order_across_batches() {
        let packages = Arc::new(MemoryProvider::new("package"));
        let services = Arc::new(MemoryProvider::new("service"));
        let files = Arc::new(
            MemoryProvider::new("file")
                .with_delay("slow", Duration::from_millis(150))
                .fail_apply("bad", Action::Create),
        );
        let exec = executor(true);

        let diffs = vec![
            create("package", "nginx"),
            create("service", "nginx"),
            create("file", "slow"),
            create("file", "fast"),
            create("file", "bad"),
        ];
        let plan = exec.create_execution_plan(&diffs).unwrap();
        assert_eq!(plan.batches.len(), 3);

        let result = exec
            .execute_with_rollback(
                &CancellationToken::new(),
                &plan,
                applier(vec![packages.clone(), services.clone(), files.clone()]),
            )
            .await;
        let (_, rollback_failures, results, _) = unwrap_failed(result);
        assert!(rollback_failures.is_empty());

        let forward_successes = results
            .iter()
            .filter(|r| r.phase == Phase::Forward && r.is_success())
            .count();
        assert_eq!(forward_successes, 4);

        let rollback_order: Vec<ResourceId> = results
            .iter()
            .filter(|r| r.phase == Phase::Rollback)
            .map(|r| r.id.clone())
            .collect();
        assert_eq!(
            rollback_order,
            vec![
                ResourceId::new("file", "slow"),
                ResourceId::new("file", "fast"),
                ResourceId::new("service", "nginx"),
                ResourceId::new("package", "nginx"),
            ]
        );
        assert!(!packages.observe("nginx").await.present);
        assert!(!files.observe("slow").await.present);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rollback_disabled_leaves_changes_in_place() {
        let packages = Arc::new(MemoryProvider::new("package"));
        let services = Arc::new(MemoryProvider::new("service").fail_apply("nginx", Action::Create));
        let files = Arc::new(MemoryProvider::new("file"));
        let exec = executor(false);

        let plan = exec
            .create_execution_plan(&[
                create("package", "nginx"),
                create("service", "nginx"),
                create("file", "conf"),
            ])
            .unwrap();

        let result = exec
            .execute_with_rollback(
                &CancellationToken::new(),
                &plan,
                applier(vec![packages.clone(), services, files.clone()]),
            )
            .await;

        let (_, _, results, message) = unwrap_failed(result);
        assert!(message.contains("rollback disabled"));
        assert!(results.iter().all(|r| r.phase == Phase::Forward));
        assert!(packages.observe("nginx").await.present);
        assert_eq!(files.apply_count().await, 0);
        let conf = results.iter().find(|r| r.id == ResourceId::new("file", "conf")).unwrap();
        assert_eq!(conf.outcome, Outcome::Skipped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_timeout_fails_only_that_operation() {
        let files = Arc::new(MemoryProvider::new("file").with_delay("hang", Duration::from_secs(10)));
        let exec = ParallelExecutor::new(ExecutorConfig {
            max_concurrency: 4,
            operation_timeout: Duration::from_millis(100),
            rollback_enabled: false,
        })
        .unwrap();

        let plan = exec
            .create_execution_plan(&[create("file", "hang"), create("file", "quick")])
            .unwrap();
        let result = exec
            .execute_with_rollback(&CancellationToken::new(), &plan, applier(vec![files.clone()]))
            .await;

        let (failures, _, results, _) = unwrap_failed(result);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].id, ResourceId::new("file", "hang"));
        let quick = results.iter().find(|r| r.id == ResourceId::new("file", "quick")).unwrap();
        assert!(quick.is_success());
        assert!(files.observe("quick").await.present);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_is_bounded() {
        let mut files = MemoryProvider::new("file");
        let mut diffs = Vec::new();
        for i in 0..8 {
            let name = format!("f{i}");
            files = files.with_delay(name.clone(), Duration::from_millis(50));
            diffs.push(create("file", &name));
        }
        let files = Arc::new(files);

        let exec = ParallelExecutor::new(ExecutorConfig {
            max_concurrency: 2,
            ..ExecutorConfig::default()
        })
        .unwrap();
        let plan = exec.create_execution_plan(&diffs).unwrap();
        exec.execute_with_rollback(&CancellationToken::new(), &plan, applier(vec![files.clone()]))
            .await
            .expect("execution failed");

        assert!(files.max_in_flight() <= 2);
        assert_eq!(files.apply_count().await, 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancellation_stops_dispatch() {
        let files = Arc::new(MemoryProvider::new("file"));
        let exec = executor(true);
        let plan = exec
            .create_execution_plan(&[create("package", "x"), create("file", "a")])
            .unwrap();

        let ctx = CancellationToken::new();
        ctx.cancel();
        let result = exec
            .execute_with_rollback(&ctx, &plan, applier(vec![files.clone()]))
            .await;

        let Err(KeelError::Execute(ExecuteError::Cancelled { results })) = result else {
            panic!("expected cancellation");
        };
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.outcome == Outcome::Skipped));
        assert_eq!(files.apply_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_during_cancellation_is_named_and_rolled_back() {
        let packages = Arc::new(MemoryProvider::new("package"));
        let files = Arc::new(
            MemoryProvider::new("file")
                .with_delay("a", Duration::from_millis(200))
                .fail_apply("a", Action::Create),
        );
        let exec = ParallelExecutor::new(ExecutorConfig {
            max_concurrency: 1,
            operation_timeout: Duration::from_secs(5),
            rollback_enabled: true,
        })
        .unwrap();
        let plan = exec
            .create_execution_plan(&[create("package", "x"), create("file", "a"), create("file", "b")])
            .unwrap();
        assert_eq!(plan.batches.len(), 2);

        let ctx = CancellationToken::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            canceller.cancel();
        });

        let result = exec
            .execute_with_rollback(&ctx, &plan, applier(vec![packages.clone(), files.clone()]))
            .await;
        let (failures, rollback_failures, results, message) = unwrap_failed(result);

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].id, ResourceId::new("file", "a"));
        assert!(message.contains("file.a"));
        assert!(rollback_failures.is_empty());

        let b = results
            .iter()
            .find(|r| r.id == ResourceId::new("file", "b"))
            .unwrap();
        assert_eq!(b.outcome, Outcome::Skipped);
        assert!(results
            .iter()
            .any(|r| r.phase == Phase::Rollback && r.id == ResourceId::new("package", "x")));
        assert!(!packages.observe("x").await.present);
        assert!(!files.observe("b").await.present);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_update_rollback_restores_snapshot() {
        let mut before = Properties::new();
        before.insert(String::from("mode"), Value::from("0600"));
        let files = Arc::new(
            MemoryProvider::new("file")
                .with_existing("key", before.clone())
                .fail_apply("other", Action::Create),
        );
        let exec = executor(true);

        let update = DiffEngine::new().compute(
            &Resource::new("file", "key").with_property("mode", "0644"),
            &ObservedState::present(before.clone()),
        );
        assert_eq!(update.action, Action::Update);
        let plan = exec
            .create_execution_plan(&[update, create("file", "other")])
            .unwrap();

        let result = exec
            .execute_with_rollback(&CancellationToken::new(), &plan, applier(vec![files.clone()]))
            .await;
        assert!(result.is_err());
        assert_eq!(files.observe("key").await.properties, before);
    }
}
