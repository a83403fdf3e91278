//! Dependency graph construction and batch levelling.
//!
//! Edges come from explicit `depends_on` declarations and from a swappable
//! [`TypePrecedence`] strategy. The graph is levelled with Kahn's algorithm:
//! each extraction round becomes one batch.

use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use crate::error::{PlanError, Result};
use crate::model::ResourceId;

use super::diff::{Action, ResourceDiff};

/// Ordering strategy between resource types.
///
/// Types with a lower rank converge before types with a higher rank unless
/// explicit dependencies say otherwise. Types without a rank carry no
/// implicit ordering.
pub trait TypePrecedence: Send + Sync + std::fmt::Debug {
    /// Rank of a resource type.
    fn rank(&self, resource_type: &str) -> Option<u32>;
}

/// Built-in precedence: packages, users, services, files, then shell commands.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPrecedence;

impl TypePrecedence for DefaultPrecedence {
    fn rank(&self, resource_type: &str) -> Option<u32> {
        match resource_type {
            "package" | "pkg" => Some(0),
            "user" | "group" => Some(1),
            "service" => Some(2),
            "file" | "directory" => Some(3),
            "shell" | "exec" => Some(4),
            _ => None,
        }
    }
}

/// Precedence table supplied by the caller.
#[derive(Debug, Default, Clone)]
pub struct StaticPrecedence {
    ranks: HashMap<String, u32>,
}

impl StaticPrecedence {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from the built-in ranks.
    #[must_use]
    pub fn from_defaults() -> Self {
        let ranks = ["package", "pkg", "user", "group", "service", "file", "directory", "shell", "exec"]
            .iter()
            .filter_map(|t| DefaultPrecedence.rank(t).map(|r| ((*t).to_string(), r)))
            .collect();
        Self { ranks }
    }

    /// Declares (or overrides) the rank of a type.
    #[must_use]
    pub fn with_rank(mut self, resource_type: impl Into<String>, rank: u32) -> Self {
        self.ranks.insert(resource_type.into(), rank);
        self
    }
}

impl TypePrecedence for StaticPrecedence {
    fn rank(&self, resource_type: &str) -> Option<u32> {
        self.ranks.get(resource_type).copied()
    }
}

/// Ordering constraints between scheduled diffs, levelled into batches.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Scheduled diffs, in input order.
    nodes: Vec<ResourceDiff>,
    /// `edges[i]` lists the nodes that must run after node `i`.
    edges: Vec<Vec<usize>>,
    /// Node indices per level.
    levels: Vec<Vec<usize>>,
    /// Actionable diffs excluded because a dependency could not be planned.
    blocked: Vec<ResourceId>,
}

impl DependencyGraph {
    /// Builds the graph for a set of diffs.
    ///
    /// Only actionable diffs are scheduled. Diffs that carry an error, and
    /// every diff that transitively depends on one, are left out and reported
    /// by [`DependencyGraph::blocked`].
    ///
    /// # Errors
    ///
    /// Returns an error if a resource appears twice or the declared
    /// dependencies form a cycle, including cycles through resources that
    /// need no change.
    pub fn build(diffs: &[ResourceDiff], precedence: &dyn TypePrecedence) -> Result<Self> {
        let mut seen = HashSet::new();
        for diff in diffs {
            if !seen.insert(&diff.id) {
                return Err(PlanError::DuplicateDiff { id: diff.id.clone() }.into());
            }
        }

        Self::check_declared_cycles(diffs)?;

        let blocked = Self::blocked_by_errors(diffs);
        let nodes: Vec<ResourceDiff> = diffs
            .iter()
            .filter(|d| d.is_actionable() && !blocked.contains(&d.id))
            .cloned()
            .collect();

        let index: HashMap<&ResourceId, usize> =
            nodes.iter().enumerate().map(|(i, d)| (&d.id, i)).collect();

        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];

        for (to, diff) in nodes.iter().enumerate() {
            for dep in &diff.resource.depends_on {
                // Dependencies that need no change are already satisfied.
                let Some(&from) = index.get(dep) else {
                    continue;
                };
                let (before, after) = Self::orient(&nodes, from, to);
                if !edges[before].contains(&after) {
                    edges[before].push(after);
                }
            }
        }

        Self::add_precedence_edges(&nodes, &mut edges, precedence);

        let levels = Self::levels(&nodes, &edges)?;
        debug!(
            "Dependency graph: {} nodes, {} edges, {} levels, {} blocked",
            nodes.len(),
            edges.iter().map(Vec::len).sum::<usize>(),
            levels.len(),
            blocked.len()
        );

        let blocked = diffs
            .iter()
            .filter(|d| d.is_actionable() && blocked.contains(&d.id))
            .map(|d| d.id.clone())
            .collect();

        Ok(Self {
            nodes,
            edges,
            levels,
            blocked,
        })
    }

    /// The scheduled diffs grouped into batches, in execution order.
    #[must_use]
    pub fn batches(&self) -> Vec<Vec<ResourceDiff>> {
        self.levels
            .iter()
            .map(|level| level.iter().map(|&i| self.nodes[i].clone()).collect())
            .collect()
    }

    /// Ordering constraints as `(before, after)` pairs.
    #[must_use]
    pub fn edges(&self) -> Vec<(ResourceId, ResourceId)> {
        self.edges
            .iter()
            .enumerate()
            .flat_map(|(from, targets)| {
                targets
                    .iter()
                    .map(move |&to| (self.nodes[from].id.clone(), self.nodes[to].id.clone()))
            })
            .collect()
    }

    /// Actionable diffs left out because a dependency could not be planned.
    #[must_use]
    pub fn blocked(&self) -> &[ResourceId] {
        &self.blocked
    }

    /// Number of scheduled diffs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if nothing is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Rejects cycles in the declared dependencies of every input diff.
    fn check_declared_cycles(diffs: &[ResourceDiff]) -> Result<()> {
        let index: HashMap<&ResourceId, usize> =
            diffs.iter().enumerate().map(|(i, d)| (&d.id, i)).collect();

        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); diffs.len()];
        for (to, diff) in diffs.iter().enumerate() {
            for dep in &diff.resource.depends_on {
                if let Some(&from) = index.get(dep) {
                    edges[from].push(to);
                }
            }
        }

        Self::levels(diffs, &edges).map(|_| ())
    }

    /// Collects ids that cannot run because they, or something they depend
    /// on, carry an error.
    fn blocked_by_errors(diffs: &[ResourceDiff]) -> HashSet<ResourceId> {
        let mut blocked: HashSet<ResourceId> = diffs
            .iter()
            .filter(|d| d.is_error())
            .map(|d| d.id.clone())
            .collect();

        loop {
            let newly: Vec<ResourceId> = diffs
                .iter()
                .filter(|d| !blocked.contains(&d.id))
                .filter(|d| d.resource.depends_on.iter().any(|dep| blocked.contains(dep)))
                .map(|d| d.id.clone())
                .collect();
            if newly.is_empty() {
                return blocked;
            }
            blocked.extend(newly);
        }
    }

    /// Orients a `from -> to` constraint. Removals run in reverse, so a
    /// dependent is deleted before what it depends on.
    fn orient(nodes: &[ResourceDiff], from: usize, to: usize) -> (usize, usize) {
        if nodes[from].action == Action::Delete && nodes[to].action == Action::Delete {
            (to, from)
        } else {
            (from, to)
        }
    }

    /// Adds type-precedence edges that do not contradict existing ordering.
    ///
    /// Only adjacent populated ranks are linked; ordering across wider rank
    /// gaps follows transitively.
    fn add_precedence_edges(
        nodes: &[ResourceDiff],
        edges: &mut [Vec<usize>],
        precedence: &dyn TypePrecedence,
    ) {
        let mut groups: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (i, diff) in nodes.iter().enumerate() {
            if let Some(rank) = precedence.rank(&diff.resource.resource_type) {
                groups.entry(rank).or_default().push(i);
            }
        }

        let groups: Vec<Vec<usize>> = groups.into_values().collect();
        for pair in groups.windows(2) {
            for &a in &pair[0] {
                for &b in &pair[1] {
                    let (before, after) = Self::orient(nodes, a, b);
                    if edges[before].contains(&after) {
                        continue;
                    }
                    // Explicit or earlier ordering in the opposite direction wins.
                    if Self::reaches(edges, after, before) {
                        continue;
                    }
                    edges[before].push(after);
                }
            }
        }
    }

    /// Returns true if `target` is reachable from `start`.
    fn reaches(edges: &[Vec<usize>], start: usize, target: usize) -> bool {
        let mut stack = vec![start];
        let mut visited = vec![false; edges.len()];
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if visited[node] {
                continue;
            }
            visited[node] = true;
            stack.extend(edges[node].iter().copied());
        }
        false
    }

    /// Levels the graph with Kahn's algorithm.
    fn levels(nodes: &[ResourceDiff], edges: &[Vec<usize>]) -> Result<Vec<Vec<usize>>> {
        let mut in_degree = vec![0usize; nodes.len()];
        for targets in edges {
            for &to in targets {
                in_degree[to] += 1;
            }
        }

        let mut done = vec![false; nodes.len()];
        let mut levels = Vec::new();
        let mut remaining = nodes.len();

        while remaining > 0 {
            let level: Vec<usize> = (0..nodes.len())
                .filter(|&i| !done[i] && in_degree[i] == 0)
                .collect();

            if level.is_empty() {
                let resources = (0..nodes.len())
                    .filter(|&i| !done[i])
                    .map(|i| nodes[i].id.clone())
                    .collect();
                return Err(PlanError::DependencyCycle { resources }.into());
            }

            for &i in &level {
                done[i] = true;
                for &to in &edges[i] {
                    in_degree[to] -= 1;
                }
            }
            remaining -= level.len();
            levels.push(level);
        }

        Ok(levels)
    }
}

/// Partitions diffs into dependency-ordered batches with the default precedence.
///
/// # Errors
///
/// Returns an error if the dependencies form a cycle.
pub fn batches(diffs: &[ResourceDiff]) -> Result<Vec<Vec<ResourceDiff>>> {
    Ok(DependencyGraph::build(diffs, &DefaultPrecedence)?.batches())
}
