//! Reconciler for converging modules.
//!
//! This module drives one reconciliation cycle: validate the module, plan it
//! against the providers, order the diffs and execute them with rollback.

use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineSettings, ModuleValidator};
use crate::error::{ConfigError, Result};
use crate::events::SharedEmitter;
use crate::model::{Module, ResourceId};
use crate::planner::{
    DiffApplier, ExecutionPlan, ExecutionReport, ExecutorConfig, ParallelExecutor, Plan, Planner,
    TypePrecedence,
};
use crate::provider::{ProviderRegistry, RegistryApplier};

/// Drives plan and apply for modules.
pub struct Reconciler {
    /// Plan construction.
    planner: Planner,
    /// Batch execution.
    executor: ParallelExecutor,
    /// Applies diffs through the providers.
    applier: Arc<dyn DiffApplier>,
    /// Module validation.
    validator: ModuleValidator,
}

/// Result of one reconciliation cycle.
#[derive(Debug, Serialize)]
pub struct ReconcileOutcome {
    /// The computed plan.
    pub plan: Plan,
    /// Batches that were, or would be, executed.
    pub execution_plan: ExecutionPlan,
    /// Execution results, absent for dry runs and plans with nothing to do.
    pub execution: Option<ExecutionReport>,
    /// Changes held back because a dependency could not be planned.
    pub blocked: Vec<ResourceId>,
    /// Whether execution was skipped on purpose.
    pub dry_run: bool,
}

impl Reconciler {
    /// Creates a reconciler over a provider registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the executor configuration is invalid.
    pub fn new(registry: Arc<ProviderRegistry>, config: ExecutorConfig) -> Result<Self> {
        let applier = Arc::new(RegistryApplier::new(Arc::clone(&registry)));
        Ok(Self {
            planner: Planner::new(registry),
            executor: ParallelExecutor::new(config)?,
            applier,
            validator: ModuleValidator::new(),
        })
    }

    /// Creates a reconciler from engine settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the executor settings are invalid.
    pub fn from_settings(registry: Arc<ProviderRegistry>, settings: &EngineSettings) -> Result<Self> {
        Self::new(registry, settings.executor.to_executor_config())
    }

    /// Sets the event emitter for planning and execution.
    #[must_use]
    pub fn with_emitter(mut self, emitter: SharedEmitter) -> Self {
        self.planner = self.planner.with_emitter(Arc::clone(&emitter));
        self.executor = self.executor.with_emitter(emitter);
        self
    }

    /// Sets the type precedence used to order unrelated resources.
    #[must_use]
    pub fn with_precedence(mut self, precedence: Arc<dyn TypePrecedence>) -> Self {
        self.executor = self.executor.with_precedence(precedence);
        self
    }

    /// Replaces the applier used for execution.
    #[must_use]
    pub fn with_applier(mut self, applier: Arc<dyn DiffApplier>) -> Self {
        self.applier = applier;
        self
    }

    /// The planner, for sharing with a drift detector.
    #[must_use]
    pub const fn planner(&self) -> &Planner {
        &self.planner
    }

    /// Converges a module.
    ///
    /// Resources that cannot be read are reported on the plan and their
    /// dependents are held back; everything else is applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the module is invalid, a resource type has no
    /// provider, the dependencies form a cycle, or execution fails.
    pub async fn reconcile(&self, ctx: &CancellationToken, module: &Module) -> Result<ReconcileOutcome> {
        self.run(ctx, module, false).await
    }

    /// Plans a module and orders its changes without applying anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the module is invalid or the dependencies form a
    /// cycle.
    pub async fn dry_run(&self, ctx: &CancellationToken, module: &Module) -> Result<ReconcileOutcome> {
        self.run(ctx, module, true).await
    }

    async fn run(&self, ctx: &CancellationToken, module: &Module, dry_run: bool) -> Result<ReconcileOutcome> {
        info!(
            "Starting {} for module {} v{}",
            if dry_run { "dry run" } else { "reconciliation" },
            module.name,
            module.version
        );

        let validation = self.validator.validate(module)?;
        for warning in &validation.warnings {
            warn!("{warning}");
        }

        let plan = self.planner.create_plan(ctx, module).await?;

        let execution_plan = self.executor.create_execution_plan(&plan.entries)?;
        let blocked = execution_plan.blocked.clone();

        if dry_run {
            return Ok(ReconcileOutcome {
                plan,
                execution_plan,
                execution: None,
                blocked,
                dry_run,
            });
        }

        let missing = plan.missing_providers();
        if !missing.is_empty() {
            warn!("Refusing to execute: {} resources have no provider", missing.len());
            return Err(ConfigError::MissingProviders { resources: missing }.into());
        }

        if execution_plan.is_empty() {
            info!("Module {} is converged, nothing to apply", module.name);
            return Ok(ReconcileOutcome {
                plan,
                execution_plan,
                execution: None,
                blocked,
                dry_run,
            });
        }

        let report = self
            .executor
            .execute_with_rollback(ctx, &execution_plan, Arc::clone(&self.applier))
            .await?;
        debug!("{report}");

        Ok(ReconcileOutcome {
            plan,
            execution_plan,
            execution: Some(report),
            blocked,
            dry_run,
        })
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("planner", &self.planner)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl ReconcileOutcome {
    /// Returns true if every scheduled change was applied and nothing was
    /// held back.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        !self.dry_run
            && self.blocked.is_empty()
            && self.plan.errors().is_empty()
            && self
                .execution
                .as_ref()
                .is_none_or(ExecutionReport::is_success)
    }
}

impl std::fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.plan)?;
        writeln!(
            f,
            "{} operations in {} batches",
            self.execution_plan.operation_count(),
            self.execution_plan.batches.len()
        )?;
        if !self.blocked.is_empty() {
            writeln!(f, "Blocked:")?;
            for id in &self.blocked {
                writeln!(f, "  - {id}")?;
            }
        }
        match &self.execution {
            Some(report) => writeln!(f, "{report}"),
            None if self.dry_run => writeln!(f, "Dry run, nothing applied"),
            None => writeln!(f, "Nothing to apply"),
        }
    }
}
