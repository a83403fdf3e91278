//! Diff engine for comparing declared vs observed resource state.
//!
//! This module defines the per-resource change model and computes it from a
//! declared [`Resource`] and the [`ObservedState`] read by its provider.

use serde::Serialize;
use tracing::debug;

use crate::model::{ObservedState, Properties, Resource, ResourceId, ResourceState, Value};

/// Engine for computing per-resource diffs.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiffEngine;

/// Change required to bring one resource to its declared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Resource needs to be created.
    Create,
    /// Resource needs to be updated.
    Update,
    /// Resource needs to be deleted.
    Delete,
    /// Resource already matches.
    NoOp,
}

/// Why a diff could not be computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffErrorKind {
    /// No provider is registered for the resource type.
    MissingProvider,
    /// The provider failed to read current state.
    Read,
}

/// Error recorded on a diff that could not be computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffError {
    /// Error category.
    pub kind: DiffErrorKind,
    /// Human-readable message.
    pub message: String,
}

/// Delta of a single property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyChange {
    /// Property key.
    pub key: String,
    /// Observed value.
    pub before: Option<Value>,
    /// Declared value.
    pub after: Option<Value>,
}

/// Difference for a single resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDiff {
    /// Resource id.
    pub id: ResourceId,
    /// Required action.
    pub action: Action,
    /// Observed properties, `None` when the resource is absent.
    pub before: Option<Properties>,
    /// Properties after the change, `None` when the resource will be absent.
    pub after: Option<Properties>,
    /// Per-property deltas.
    pub changes: Vec<PropertyChange>,
    /// Set when the diff could not be computed; such a diff is never executed.
    pub error: Option<DiffError>,
    /// The declared resource this diff was computed for.
    pub resource: Resource,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the diff between a declared resource and its observed state.
    #[must_use]
    pub fn compute(&self, resource: &Resource, observed: &ObservedState) -> ResourceDiff {
        let id = resource.id();

        match (resource.state, observed.present) {
            (ResourceState::Present, false) => {
                debug!("{id} needs to be created");
                let changes = resource
                    .properties
                    .iter()
                    .map(|(key, value)| PropertyChange {
                        key: key.clone(),
                        before: None,
                        after: Some(value.clone()),
                    })
                    .collect();
                ResourceDiff {
                    id,
                    action: Action::Create,
                    before: None,
                    after: Some(resource.properties.clone()),
                    changes,
                    error: None,
                    resource: resource.clone(),
                }
            }

            (ResourceState::Absent, true) => {
                debug!("{id} needs to be deleted");
                let changes = observed
                    .properties
                    .iter()
                    .map(|(key, value)| PropertyChange {
                        key: key.clone(),
                        before: Some(value.clone()),
                        after: None,
                    })
                    .collect();
                ResourceDiff {
                    id,
                    action: Action::Delete,
                    before: Some(observed.properties.clone()),
                    after: None,
                    changes,
                    error: None,
                    resource: resource.clone(),
                }
            }

            (ResourceState::Absent, false) => ResourceDiff {
                id,
                action: Action::NoOp,
                before: None,
                after: None,
                changes: vec![],
                error: None,
                resource: resource.clone(),
            },

            (ResourceState::Present, true) => {
                let changes = Self::property_changes(&resource.properties, &observed.properties);
                let action = if changes.is_empty() {
                    Action::NoOp
                } else {
                    debug!("{id} needs update ({} properties differ)", changes.len());
                    Action::Update
                };

                // Observed keys the module does not declare are left untouched.
                let mut after = observed.properties.clone();
                after.extend(resource.properties.clone());

                ResourceDiff {
                    id,
                    action,
                    before: Some(observed.properties.clone()),
                    after: Some(after),
                    changes,
                    error: None,
                    resource: resource.clone(),
                }
            }
        }
    }

    /// Builds a diff for a resource whose state could not be determined.
    #[must_use]
    pub fn failed(resource: &Resource, kind: DiffErrorKind, message: impl Into<String>) -> ResourceDiff {
        ResourceDiff {
            id: resource.id(),
            action: Action::NoOp,
            before: None,
            after: None,
            changes: vec![],
            error: Some(DiffError {
                kind,
                message: message.into(),
            }),
            resource: resource.clone(),
        }
    }

    /// Compares every declared property against the observed value.
    fn property_changes(declared: &Properties, observed: &Properties) -> Vec<PropertyChange> {
        declared
            .iter()
            .filter(|(key, value)| observed.get(*key) != Some(*value))
            .map(|(key, value)| PropertyChange {
                key: key.clone(),
                before: observed.get(key).cloned(),
                after: Some(value.clone()),
            })
            .collect()
    }
}

impl ResourceDiff {
    /// Returns true if this diff requires a change and can be executed.
    #[must_use]
    pub const fn is_actionable(&self) -> bool {
        self.error.is_none() && !matches!(self.action, Action::NoOp)
    }

    /// Returns true if the diff could not be computed.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for DiffError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            DiffErrorKind::MissingProvider => write!(f, "missing provider: {}", self.message),
            DiffErrorKind::Read => write!(f, "read failed: {}", self.message),
        }
    }
}

impl std::fmt::Display for PropertyChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |v: &Option<Value>| v.as_ref().map_or_else(|| String::from("<unset>"), ToString::to_string);
        write!(f, "{}: {} -> {}", self.key, show(&self.before), show(&self.after))
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(error) = &self.error {
            return write!(f, "{}: error ({error})", self.id);
        }
        write!(f, "{}: {}", self.id, self.action)?;
        if !self.changes.is_empty() {
            write!(f, " (")?;
            for (i, change) in self.changes.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", change.key)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(pairs: &[(&str, Value)]) -> ObservedState {
        ObservedState::present(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn test_create_when_absent() {
        let resource = Resource::new("package", "git").with_property("version", "2.43");
        let diff = DiffEngine::new().compute(&resource, &ObservedState::absent());

        assert_eq!(diff.action, Action::Create);
        assert!(diff.before.is_none());
        assert_eq!(diff.changes.len(), 1);
        assert!(diff.is_actionable());
    }

    #[test]
    fn test_delete_when_present_but_desired_absent() {
        let resource = Resource::new("user", "deploy").with_state(ResourceState::Absent);
        let diff = DiffEngine::new().compute(&resource, &observed(&[("uid", Value::from(1001))]));

        assert_eq!(diff.action, Action::Delete);
        assert!(diff.after.is_none());
        assert_eq!(diff.before.unwrap()["uid"], Value::Int(1001));
    }

    #[test]
    fn test_noop_when_absent_and_desired_absent() {
        let resource = Resource::new("user", "deploy").with_state(ResourceState::Absent);
        let diff = DiffEngine::new().compute(&resource, &ObservedState::absent());
        assert_eq!(diff.action, Action::NoOp);
        assert!(!diff.is_actionable());
    }

    #[test]
    fn test_update_only_on_declared_properties() {
        let resource = Resource::new("file", "motd")
            .with_property("content", "hello")
            .with_property("mode", "0644");

        let same = observed(&[
            ("content", Value::from("hello")),
            ("mode", Value::from("0644")),
            ("inode", Value::from(42)),
        ]);
        assert_eq!(DiffEngine::new().compute(&resource, &same).action, Action::NoOp);

        let drifted = observed(&[("content", Value::from("bye")), ("mode", Value::from("0644"))]);
        let diff = DiffEngine::new().compute(&resource, &drifted);
        assert_eq!(diff.action, Action::Update);
        assert_eq!(diff.changes.len(), 1);
        assert_eq!(diff.changes[0].key, "content");
        assert_eq!(diff.changes[0].before, Some(Value::from("bye")));
        assert_eq!(diff.after.unwrap()["content"], Value::from("hello"));
    }

    #[test]
    fn test_missing_observed_property_is_update() {
        let resource = Resource::new("service", "sshd").with_property("enabled", true);
        let diff = DiffEngine::new().compute(&resource, &observed(&[]));
        assert_eq!(diff.action, Action::Update);
        assert_eq!(diff.changes[0].before, None);
    }

    #[test]
    fn test_failed_diff_is_not_actionable() {
        let resource = Resource::new("cron", "backup");
        let diff = DiffEngine::failed(&resource, DiffErrorKind::MissingProvider, "cron");
        assert!(diff.is_error());
        assert!(!diff.is_actionable());
        assert_eq!(diff.to_string(), "cron.backup: error (missing provider: cron)");
    }
}
