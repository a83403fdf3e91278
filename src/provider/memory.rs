//! In-process provider backed by a state map.
//!
//! Useful for embedding the engine in tests and for dry-running modules
//! against a synthetic target. Failures and latency can be injected per
//! resource name, and every call is recorded.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{KeelError, ProviderError, Result};
use crate::model::{ObservedState, Properties, Resource, ResourceId};
use crate::planner::{Action, ResourceDiff};

use super::registry::Provider;

/// Provider keeping resource state in memory.
#[derive(Debug)]
pub struct MemoryProvider {
    /// Resource type served.
    resource_type: &'static str,
    /// Current state by resource name.
    state: RwLock<HashMap<String, ObservedState>>,
    /// Names whose read fails.
    failing_reads: HashSet<String>,
    /// `(name, action)` pairs whose apply fails.
    failing_applies: HashSet<(String, Action)>,
    /// Artificial apply latency by name.
    delays: HashMap<String, Duration>,
    /// Applied diffs in completion order.
    applied: Mutex<Vec<(ResourceId, Action)>>,
    /// Number of read calls.
    reads: AtomicUsize,
    /// Applies currently running.
    in_flight: AtomicUsize,
    /// Highest number of concurrent applies seen.
    max_in_flight: AtomicUsize,
}

impl MemoryProvider {
    /// Creates a provider with an empty target.
    #[must_use]
    pub fn new(resource_type: &'static str) -> Self {
        Self {
            resource_type,
            state: RwLock::new(HashMap::new()),
            failing_reads: HashSet::new(),
            failing_applies: HashSet::new(),
            delays: HashMap::new(),
            applied: Mutex::new(Vec::new()),
            reads: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Seeds an existing resource with the given properties.
    #[must_use]
    pub fn with_existing(mut self, name: impl Into<String>, properties: Properties) -> Self {
        self.state
            .get_mut()
            .insert(name.into(), ObservedState::present(properties));
        self
    }

    /// Makes reads of `name` fail.
    #[must_use]
    pub fn fail_read(mut self, name: impl Into<String>) -> Self {
        self.failing_reads.insert(name.into());
        self
    }

    /// Makes applying `action` to `name` fail.
    #[must_use]
    pub fn fail_apply(mut self, name: impl Into<String>, action: Action) -> Self {
        self.failing_applies.insert((name.into(), action));
        self
    }

    /// Delays every apply of `name`.
    #[must_use]
    pub fn with_delay(mut self, name: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(name.into(), delay);
        self
    }

    /// Replaces the observed state of `name`, simulating out-of-band change.
    pub async fn set(&self, name: impl Into<String>, state: ObservedState) {
        self.state.write().await.insert(name.into(), state);
    }

    /// Current state of `name`.
    pub async fn observe(&self, name: &str) -> ObservedState {
        self.state
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or_else(ObservedState::absent)
    }

    /// Successfully applied diffs, in completion order.
    pub async fn applied(&self) -> Vec<(ResourceId, Action)> {
        self.applied.lock().await.clone()
    }

    /// Number of successful applies.
    pub async fn apply_count(&self) -> usize {
        self.applied.lock().await.len()
    }

    /// Number of read calls made.
    #[must_use]
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Highest number of applies that ran at the same time.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn apply_inner(&self, resource: &Resource, diff: &ResourceDiff) -> Result<()> {
        if let Some(delay) = self.delays.get(&resource.name) {
            tokio::time::sleep(*delay).await;
        }

        if self
            .failing_applies
            .contains(&(resource.name.clone(), diff.action))
        {
            return Err(ProviderError::apply(&diff.id, diff.action, "injected failure").into());
        }

        let mut state = self.state.write().await;
        match diff.action {
            Action::Create | Action::Update => {
                let properties = diff.after.clone().unwrap_or_default();
                state.insert(resource.name.clone(), ObservedState::present(properties));
            }
            Action::Delete => {
                state.remove(&resource.name);
            }
            Action::NoOp => return Ok(()),
        }
        drop(state);

        debug!("Applied {} to {}", diff.action, diff.id);
        self.applied.lock().await.push((diff.id.clone(), diff.action));
        Ok(())
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn resource_type(&self) -> &'static str {
        self.resource_type
    }

    async fn read(&self, _ctx: &CancellationToken, resource: &Resource) -> Result<ObservedState> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing_reads.contains(&resource.name) {
            return Err(KeelError::from(ProviderError::read(&resource.id(), "injected failure")));
        }
        Ok(self.observe(&resource.name).await)
    }

    async fn apply(&self, _ctx: &CancellationToken, resource: &Resource, diff: &ResourceDiff) -> Result<()> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let result = self.apply_inner(resource, diff).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
