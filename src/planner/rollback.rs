//! Compensation journal for applied diffs.
//!
//! Every successfully applied diff is recorded together with the state
//! captured before it ran. Unwinding replays the journal newest-first,
//! applying the inverse of each entry.

use crate::model::{ObservedState, ResourceState};

use super::diff::{Action, PropertyChange, ResourceDiff};

/// An applied diff and the state captured before it.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackEntry {
    /// The diff that was applied.
    pub diff: ResourceDiff,
    /// State read before applying.
    pub snapshot: ObservedState,
    /// Position in completion order, starting at zero.
    pub sequence: usize,
}

/// Applied diffs in completion order.
#[derive(Debug, Default, Clone)]
pub struct RollbackJournal {
    entries: Vec<RollbackEntry>,
}

impl RollbackEntry {
    /// Builds the diff that restores the captured snapshot.
    ///
    /// A create is undone by a delete, an update by re-applying the snapshot
    /// and a delete by re-creating the snapshot.
    #[must_use]
    pub fn inverse(&self) -> ResourceDiff {
        let applied = &self.diff;
        let mut resource = applied.resource.clone();
        resource.depends_on.clear();

        match applied.action {
            Action::Create => {
                resource.state = ResourceState::Absent;
                let changes = applied
                    .after
                    .iter()
                    .flatten()
                    .map(|(key, value)| PropertyChange {
                        key: key.clone(),
                        before: Some(value.clone()),
                        after: None,
                    })
                    .collect();
                ResourceDiff {
                    id: applied.id.clone(),
                    action: Action::Delete,
                    before: applied.after.clone(),
                    after: None,
                    changes,
                    error: None,
                    resource,
                }
            }

            Action::Update => {
                resource.state = ResourceState::Present;
                resource.properties = self.snapshot.properties.clone();
                let changes = applied
                    .changes
                    .iter()
                    .map(|change| PropertyChange {
                        key: change.key.clone(),
                        before: change.after.clone(),
                        after: self.snapshot.properties.get(&change.key).cloned(),
                    })
                    .collect();
                ResourceDiff {
                    id: applied.id.clone(),
                    action: Action::Update,
                    before: applied.after.clone(),
                    after: Some(self.snapshot.properties.clone()),
                    changes,
                    error: None,
                    resource,
                }
            }

            Action::Delete => {
                resource.state = ResourceState::Present;
                resource.properties = self.snapshot.properties.clone();
                let changes = self
                    .snapshot
                    .properties
                    .iter()
                    .map(|(key, value)| PropertyChange {
                        key: key.clone(),
                        before: None,
                        after: Some(value.clone()),
                    })
                    .collect();
                ResourceDiff {
                    id: applied.id.clone(),
                    action: Action::Create,
                    before: None,
                    after: Some(self.snapshot.properties.clone()),
                    changes,
                    error: None,
                    resource,
                }
            }

            Action::NoOp => ResourceDiff {
                id: applied.id.clone(),
                action: Action::NoOp,
                before: applied.after.clone(),
                after: applied.after.clone(),
                changes: vec![],
                error: None,
                resource,
            },
        }
    }
}

impl RollbackJournal {
    /// Creates an empty journal.
    #[must_use]
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Records a successfully applied diff.
    pub fn record(&mut self, diff: ResourceDiff, snapshot: ObservedState) {
        let sequence = self.entries.len();
        self.entries.push(RollbackEntry {
            diff,
            snapshot,
            sequence,
        });
    }

    /// Entries in completion order.
    #[must_use]
    pub fn entries(&self) -> &[RollbackEntry] {
        &self.entries
    }

    /// Takes every entry, most recently applied first.
    pub fn drain_for_unwind(&mut self) -> Vec<RollbackEntry> {
        let mut entries = std::mem::take(&mut self.entries);
        entries.reverse();
        entries
    }

    /// Number of recorded entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Properties, Resource, Value};
    use crate::planner::DiffEngine;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Value::from(*v)))
            .collect()
    }

    #[test]
    fn test_create_is_undone_by_delete() {
        let resource = Resource::new("file", "a").with_property("content", "x");
        let diff = DiffEngine::new().compute(&resource, &ObservedState::absent());
        let entry = RollbackEntry {
            diff,
            snapshot: ObservedState::absent(),
            sequence: 0,
        };

        let inverse = entry.inverse();
        assert_eq!(inverse.action, Action::Delete);
        assert_eq!(inverse.resource.state, ResourceState::Absent);
        assert!(inverse.after.is_none());
    }

    #[test]
    fn test_update_restores_snapshot() {
        let snapshot = ObservedState::present(props(&[("mode", "0600"), ("owner", "root")]));
        let resource = Resource::new("file", "key").with_property("mode", "0644");
        let diff = DiffEngine::new().compute(&resource, &snapshot);
        let entry = RollbackEntry {
            diff,
            snapshot: snapshot.clone(),
            sequence: 0,
        };

        let inverse = entry.inverse();
        assert_eq!(inverse.action, Action::Update);
        assert_eq!(inverse.after, Some(snapshot.properties));
        assert_eq!(inverse.changes[0].after, Some(Value::from("0600")));
    }

    #[test]
    fn test_delete_is_undone_by_recreate() {
        let snapshot = ObservedState::present(props(&[("uid", "1001")]));
        let resource = Resource::new("user", "deploy").with_state(ResourceState::Absent);
        let diff = DiffEngine::new().compute(&resource, &snapshot);
        let entry = RollbackEntry {
            diff,
            snapshot: snapshot.clone(),
            sequence: 0,
        };

        let inverse = entry.inverse();
        assert_eq!(inverse.action, Action::Create);
        assert_eq!(inverse.resource.state, ResourceState::Present);
        assert_eq!(inverse.resource.properties, snapshot.properties);
    }

    #[test]
    fn test_unwind_is_reverse_completion_order() {
        let mut journal = RollbackJournal::new();
        for name in ["a", "b", "c"] {
            let diff = DiffEngine::new().compute(&Resource::new("file", name), &ObservedState::absent());
            journal.record(diff, ObservedState::absent());
        }

        let unwound: Vec<String> = journal
            .drain_for_unwind()
            .iter()
            .map(|e| e.diff.id.to_string())
            .collect();
        assert_eq!(unwound, vec!["file.c", "file.b", "file.a"]);
        assert!(journal.is_empty());
    }
}
