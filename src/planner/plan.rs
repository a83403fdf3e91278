//! Plan construction.
//!
//! The [`Planner`] reads the current state of every resource of a module and
//! turns it into an immutable [`Plan`] holding exactly one diff per resource.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConfigHasher;
use crate::error::{PlanError, Result};
use crate::events::{emit_best_effort, noop, Event, SharedEmitter};
use crate::model::{Module, ResourceId};
use crate::provider::ProviderRegistry;

use super::diff::{Action, DiffEngine, DiffErrorKind, ResourceDiff};

/// Counted actions of a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Resources to create.
    pub to_create: usize,
    /// Resources to update.
    pub to_update: usize,
    /// Resources to delete.
    pub to_delete: usize,
    /// Resources already converged.
    pub unchanged: usize,
    /// Resources whose diff could not be computed.
    pub errored: usize,
}

/// Snapshot of the changes needed to converge a module.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// Unique plan id.
    pub id: Uuid,
    /// Module name.
    pub module: String,
    /// Module version.
    pub module_version: String,
    /// Fingerprint of the module the plan was computed from.
    pub module_hash: String,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// One diff per declared resource, in declaration order.
    pub entries: Vec<ResourceDiff>,
    /// Counted actions.
    pub summary: PlanSummary,
}

/// Computes plans from modules.
#[derive(Clone)]
pub struct Planner {
    /// Provider lookup.
    registry: Arc<ProviderRegistry>,
    /// Diff computation.
    diff_engine: DiffEngine,
    /// Module fingerprinting.
    hasher: ConfigHasher,
    /// Event sink.
    emitter: SharedEmitter,
}

impl Planner {
    /// Creates a planner over a provider registry.
    #[must_use]
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            diff_engine: DiffEngine::new(),
            hasher: ConfigHasher::new(),
            emitter: noop(),
        }
    }

    /// Sets the event emitter.
    #[must_use]
    pub fn with_emitter(mut self, emitter: SharedEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// The registry this planner reads through.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Creates a plan for a validated module.
    ///
    /// Missing providers and read failures are recorded on the affected diff
    /// and do not stop the other resources from being planned.
    ///
    /// # Errors
    ///
    /// Returns an error if `ctx` is cancelled before planning completes.
    pub async fn create_plan(&self, ctx: &CancellationToken, module: &Module) -> Result<Plan> {
        info!(
            "Planning module {} v{} ({} resources)",
            module.name,
            module.version,
            module.resources.len()
        );
        emit_best_effort(
            self.emitter.as_ref(),
            &Event::PlanStarted {
                module: module.name.clone(),
            },
        );

        let mut entries = Vec::with_capacity(module.resources.len());

        for resource in &module.resources {
            if ctx.is_cancelled() {
                warn!("Planning of {} cancelled", module.name);
                return Err(PlanError::Cancelled {
                    module: module.name.clone(),
                }
                .into());
            }

            let diff = match self.registry.get(&resource.resource_type) {
                Err(e) => {
                    warn!("{}: {e}", resource.id());
                    DiffEngine::failed(resource, DiffErrorKind::MissingProvider, e.to_string())
                }
                Ok(provider) => match provider.read(ctx, resource).await {
                    Ok(observed) => self.diff_engine.compute(resource, &observed),
                    Err(e) => {
                        warn!("Failed to read {}: {e}", resource.id());
                        DiffEngine::failed(resource, DiffErrorKind::Read, e.to_string())
                    }
                },
            };

            debug!("Planned {diff}");
            entries.push(diff);
        }

        let summary = PlanSummary::from_diffs(&entries);
        info!(
            "Plan: {} creates, {} updates, {} deletes, {} unchanged, {} errors",
            summary.to_create, summary.to_update, summary.to_delete, summary.unchanged, summary.errored
        );

        emit_best_effort(
            self.emitter.as_ref(),
            &Event::PlanCompleted {
                module: module.name.clone(),
                summary,
            },
        );

        Ok(Plan {
            id: Uuid::new_v4(),
            module: module.name.clone(),
            module_version: module.version.clone(),
            module_hash: self.hasher.hash_module(module),
            created_at: Utc::now(),
            entries,
            summary,
        })
    }
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl PlanSummary {
    /// Counts the actions of a list of diffs.
    #[must_use]
    pub fn from_diffs(diffs: &[ResourceDiff]) -> Self {
        diffs.iter().fold(Self::default(), |mut summary, diff| {
            if diff.is_error() {
                summary.errored += 1;
            } else {
                match diff.action {
                    Action::Create => summary.to_create += 1,
                    Action::Update => summary.to_update += 1,
                    Action::Delete => summary.to_delete += 1,
                    Action::NoOp => summary.unchanged += 1,
                }
            }
            summary
        })
    }

    /// Returns true if any change is required.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.to_create > 0 || self.to_update > 0 || self.to_delete > 0
    }

    /// Total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.to_create + self.to_update + self.to_delete
    }
}

impl Plan {
    /// Returns true if the plan requires no change.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.summary.has_changes()
    }

    /// Diffs that require a change and can be executed.
    #[must_use]
    pub fn actionable(&self) -> Vec<&ResourceDiff> {
        self.entries.iter().filter(|d| d.is_actionable()).collect()
    }

    /// Diffs that could not be computed.
    #[must_use]
    pub fn errors(&self) -> Vec<&ResourceDiff> {
        self.entries.iter().filter(|d| d.is_error()).collect()
    }

    /// Resources whose type has no registered provider.
    #[must_use]
    pub fn missing_providers(&self) -> Vec<ResourceId> {
        self.entries
            .iter()
            .filter(|d| {
                d.error
                    .as_ref()
                    .is_some_and(|e| e.kind == DiffErrorKind::MissingProvider)
            })
            .map(|d| d.id.clone())
            .collect()
    }

    /// Returns true if any resource failed for a configuration reason.
    #[must_use]
    pub fn has_configuration_errors(&self) -> bool {
        !self.missing_providers().is_empty()
    }

    /// Looks up the diff of a resource.
    #[must_use]
    pub fn entry(&self, id: &ResourceId) -> Option<&ResourceDiff> {
        self.entries.iter().find(|d| &d.id == id)
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.to_create, self.to_update, self.to_delete, self.unchanged
        )?;
        if self.errored > 0 {
            write!(f, ", {} errored", self.errored)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Plan for {} v{}: {}", self.module, self.module_version, self.summary)?;
        for diff in &self.entries {
            if diff.is_actionable() || diff.is_error() {
                writeln!(f, "  {diff}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Properties, Resource, Value};
    use crate::provider::{MemoryProvider, Provider};

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Value::from(*v)))
            .collect()
    }

    fn registry(providers: Vec<Arc<dyn Provider>>) -> Arc<ProviderRegistry> {
        let mut registry = ProviderRegistry::new();
        for provider in providers {
            registry.register(provider).expect("register failed");
        }
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_plan_one_entry_per_resource_regardless_of_errors() {
        let files = Arc::new(MemoryProvider::new("file").fail_read("broken"));
        let planner = Planner::new(registry(vec![files as Arc<dyn Provider>]));

        let module = Module::new("web", "1.0.0")
            .with_resource(Resource::new("file", "ok"))
            .with_resource(Resource::new("file", "broken"))
            .with_resource(Resource::new("cron", "backup"));

        let plan = planner
            .create_plan(&CancellationToken::new(), &module)
            .await
            .expect("plan failed");

        assert_eq!(plan.entries.len(), 3);
        assert_eq!(plan.entries[0].action, Action::Create);
        assert_eq!(
            plan.entries[1].error.as_ref().map(|e| e.kind),
            Some(DiffErrorKind::Read)
        );
        assert_eq!(
            plan.entries[2].error.as_ref().map(|e| e.kind),
            Some(DiffErrorKind::MissingProvider)
        );
        assert_eq!(plan.summary.to_create, 1);
        assert_eq!(plan.summary.errored, 2);
        assert_eq!(plan.missing_providers(), vec![ResourceId::new("cron", "backup")]);
        assert!(plan.has_configuration_errors());
    }

    #[tokio::test]
    async fn test_unchanged_target_yields_empty_summary() {
        let packages = Arc::new(
            MemoryProvider::new("package").with_existing("git", props(&[("version", "2.43")])),
        );
        let planner = Planner::new(registry(vec![packages as Arc<dyn Provider>]));
        let module = Module::new("base", "1.0.0")
            .with_resource(Resource::new("package", "git").with_property("version", "2.43"));

        let plan = planner
            .create_plan(&CancellationToken::new(), &module)
            .await
            .unwrap();

        assert_eq!(
            plan.summary,
            PlanSummary {
                unchanged: 1,
                ..PlanSummary::default()
            }
        );
        assert!(plan.is_empty());
        assert!(plan.actionable().is_empty());
    }

    #[tokio::test]
    async fn test_second_pass_after_convergence_is_noop() {
        let files = Arc::new(MemoryProvider::new("file"));
        let planner = Planner::new(registry(vec![files.clone() as Arc<dyn Provider>]));
        let module = Module::new("motd", "1.0.0")
            .with_resource(Resource::new("file", "motd").with_property("content", "hello"));
        let ctx = CancellationToken::new();

        let first = planner.create_plan(&ctx, &module).await.unwrap();
        for diff in first.actionable() {
            files.apply(&ctx, &diff.resource, diff).await.unwrap();
        }

        let second = planner.create_plan(&ctx, &module).await.unwrap();
        assert!(second.entries.iter().all(|d| d.action == Action::NoOp));
        assert_eq!(first.module_hash, second.module_hash);
    }

    #[tokio::test]
    async fn test_cancelled_planning_fails() {
        let planner = Planner::new(registry(vec![Arc::new(MemoryProvider::new("file")) as Arc<dyn Provider>]));
        let module = Module::new("m", "1").with_resource(Resource::new("file", "a"));
        let ctx = CancellationToken::new();
        ctx.cancel();

        let result = planner.create_plan(&ctx, &module).await;
        assert!(matches!(
            result,
            Err(crate::error::KeelError::Plan(PlanError::Cancelled { .. }))
        ));
    }
}
