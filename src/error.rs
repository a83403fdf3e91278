//! Error types for the Keel reconciliation engine.
//!
//! This module provides the error hierarchy for every stage of a
//! reconciliation cycle: configuration, providers, planning, execution
//! and drift detection.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::model::ResourceId;
use crate::planner::{Action, OperationResult, Outcome};

/// The main error type for the Keel engine.
#[derive(Debug, Error)]
pub enum KeelError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Provider lookup and invocation errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Execution errors.
    #[error("Execution error: {0}")]
    Execute(#[from] ExecuteError),

    /// Drift detection errors.
    #[error("Drift error: {0}")]
    Drift(#[from] DriftError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Duplicate resource definition.
    #[error("Duplicate resource id: {id}")]
    DuplicateResource {
        /// The duplicated id.
        id: ResourceId,
    },

    /// A resource depends on a resource that is not declared.
    #[error("Resource {id} depends on unknown resource {dependency}")]
    UnknownDependency {
        /// The declaring resource.
        id: ResourceId,
        /// The missing dependency.
        dependency: ResourceId,
    },

    /// One or more resources have no registered provider.
    #[error("No provider registered for: {}", join_ids(.resources))]
    MissingProviders {
        /// Resources whose type has no provider.
        resources: Vec<ResourceId>,
    },
}

/// Provider registry and invocation errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// A provider for this type is already registered.
    #[error("Provider already registered for resource type '{resource_type}'")]
    DuplicateType {
        /// The duplicated type name.
        resource_type: String,
    },

    /// No provider is registered for this type.
    #[error("No provider registered for resource type '{resource_type}'")]
    NotFound {
        /// The unknown type name.
        resource_type: String,
    },

    /// Reading current state failed.
    #[error("Failed to read {id}: {message}")]
    ReadFailed {
        /// Resource being read.
        id: ResourceId,
        /// Provider message.
        message: String,
    },

    /// Applying a change failed.
    #[error("Failed to {action} {id}: {message}")]
    ApplyFailed {
        /// Resource being changed.
        id: ResourceId,
        /// Attempted action.
        action: Action,
        /// Provider message.
        message: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The dependency graph contains a cycle.
    #[error("Dependency cycle between: {}", join_ids(.resources))]
    DependencyCycle {
        /// Resources participating in (or blocked behind) the cycle.
        resources: Vec<ResourceId>,
    },

    /// The same resource appears twice in the input.
    #[error("Resource {id} appears more than once in the plan")]
    DuplicateDiff {
        /// The repeated resource id.
        id: ResourceId,
    },

    /// Planning was cancelled by the caller.
    #[error("Planning cancelled for module '{module}'")]
    Cancelled {
        /// Module being planned.
        module: String,
    },
}

/// Execution errors.
///
/// Both variants carry every operation attempted before the failure so the
/// caller can inspect exactly what was applied and unwound.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// Invalid executor configuration.
    #[error("Invalid executor configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// One or more operations failed.
    #[error("{}", describe_failure(.failures, .rollback_failures, .rolled_back))]
    Failed {
        /// Forward operations that failed.
        failures: Vec<OperationFailure>,
        /// Rollback operations that failed.
        rollback_failures: Vec<OperationFailure>,
        /// Whether a rollback sweep was performed.
        rolled_back: bool,
        /// Every attempted operation, forward and rollback.
        results: Vec<OperationResult>,
    },

    /// Execution stopped because the caller cancelled it.
    #[error("Execution cancelled after {} operations", attempted(.results))]
    Cancelled {
        /// Every attempted operation.
        results: Vec<OperationResult>,
    },
}

/// Drift detection errors.
#[derive(Debug, Error)]
pub enum DriftError {
    /// The drift check could not plan the module.
    #[error("Drift check failed for module '{module}': {reason}")]
    CheckFailed {
        /// Module being checked.
        module: String,
        /// Underlying reason.
        reason: String,
    },

    /// The report receiver went away.
    #[error("Drift report receiver closed")]
    SinkClosed,
}

/// A single failed operation, as reported inside [`ExecuteError::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationFailure {
    /// Resource the operation targeted.
    pub id: ResourceId,
    /// Action that was attempted.
    pub action: Action,
    /// Failure description.
    pub message: String,
}

/// Result type alias for Keel operations.
pub type Result<T> = std::result::Result<T, KeelError>;

impl KeelError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error concerns a single resource and the cycle
    /// may be retried as a whole.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(ProviderError::ReadFailed { .. } | ProviderError::ApplyFailed { .. })
                | Self::Execute(ExecuteError::Failed { .. })
        )
    }

    /// Returns the operations attempted before an execution error, if any.
    #[must_use]
    pub fn execution_results(&self) -> Option<&[OperationResult]> {
        match self {
            Self::Execute(err) => err.results(),
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl ProviderError {
    /// Creates a read error for a resource.
    #[must_use]
    pub fn read(id: &ResourceId, message: impl Into<String>) -> Self {
        Self::ReadFailed {
            id: id.clone(),
            message: message.into(),
        }
    }

    /// Creates an apply error for a resource.
    #[must_use]
    pub fn apply(id: &ResourceId, action: Action, message: impl Into<String>) -> Self {
        Self::ApplyFailed {
            id: id.clone(),
            action,
            message: message.into(),
        }
    }
}

impl ExecuteError {
    /// Returns the operations attempted before this error, if it carries any.
    #[must_use]
    pub fn results(&self) -> Option<&[OperationResult]> {
        match self {
            Self::Failed { results, .. } | Self::Cancelled { results } => Some(results),
            Self::InvalidConfig { .. } => None,
        }
    }
}

impl OperationFailure {
    /// Creates a failure record.
    #[must_use]
    pub fn new(id: ResourceId, action: Action, message: impl Into<String>) -> Self {
        Self {
            id,
            action,
            message: message.into(),
        }
    }

    /// Creates a failure record for an operation that exceeded its timeout.
    #[must_use]
    pub fn timed_out(id: ResourceId, action: Action, timeout: Duration) -> Self {
        Self::new(id, action, format!("timed out after {}ms", timeout.as_millis()))
    }
}

impl std::fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.action, self.id, self.message)
    }
}

fn join_ids(ids: &[ResourceId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn attempted(results: &[OperationResult]) -> usize {
    results.iter().filter(|r| r.outcome != Outcome::Skipped).count()
}

fn describe_failure(
    failures: &[OperationFailure],
    rollback_failures: &[OperationFailure],
    rolled_back: &bool,
) -> String {
    let mut message = format!(
        "{} operation(s) failed: {}",
        failures.len(),
        failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    );

    if *rolled_back {
        if rollback_failures.is_empty() {
            message.push_str("; rollback completed");
        } else {
            message.push_str(&format!(
                "; {} rollback failure(s): {}",
                rollback_failures.len(),
                rollback_failures
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ")
            ));
        }
    } else {
        message.push_str("; rollback disabled, applied changes left in place");
    }

    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_message_names_resources() {
        let err = ExecuteError::Failed {
            failures: vec![OperationFailure::new(
                ResourceId::new("file", "b"),
                Action::Create,
                "disk full",
            )],
            rollback_failures: vec![OperationFailure::new(
                ResourceId::new("file", "a"),
                Action::Delete,
                "permission denied",
            )],
            rolled_back: true,
            results: vec![],
        };

        let message = err.to_string();
        assert!(message.contains("create file.b: disk full"));
        assert!(message.contains("delete file.a: permission denied"));
        assert!(message.contains("1 rollback failure(s)"));
    }

    #[test]
    fn test_failure_message_without_rollback() {
        let err = ExecuteError::Failed {
            failures: vec![OperationFailure::timed_out(
                ResourceId::new("pkg", "git"),
                Action::Create,
                Duration::from_millis(250),
            )],
            rollback_failures: vec![],
            rolled_back: false,
            results: vec![],
        };

        let message = err.to_string();
        assert!(message.contains("pkg.git"));
        assert!(message.contains("timed out after 250ms"));
        assert!(message.contains("rollback disabled"));
    }

    #[test]
    fn test_cancelled_message_counts_attempted_only() {
        let result = |name: &str, outcome: Outcome| OperationResult {
            id: ResourceId::new("file", name),
            action: Action::Create,
            phase: crate::planner::Phase::Forward,
            outcome,
            duration: Duration::ZERO,
            batch: Some(0),
            snapshot: None,
        };
        let err = ExecuteError::Cancelled {
            results: vec![
                result("a", Outcome::Succeeded),
                result("b", Outcome::Skipped),
                result("c", Outcome::Skipped),
            ],
        };

        assert_eq!(err.to_string(), "Execution cancelled after 1 operations");
    }

    #[test]
    fn test_missing_providers_lists_ids() {
        let err = ConfigError::MissingProviders {
            resources: vec![ResourceId::new("cron", "backup"), ResourceId::new("cron", "rotate")],
        };
        assert_eq!(
            err.to_string(),
            "No provider registered for: cron.backup, cron.rotate"
        );
    }

    #[test]
    fn test_retryable() {
        let err = KeelError::from(ProviderError::read(&ResourceId::new("pkg", "git"), "timeout"));
        assert!(err.is_retryable());
        assert!(!KeelError::internal("boom").is_retryable());
    }
}
