//! Provider trait and type registry.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ProviderError, Result};
use crate::model::{ObservedState, Resource};
use crate::planner::{DiffApplier, ResourceDiff};

/// Capability to read and change resources of one type.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Resource type handled by this provider.
    fn resource_type(&self) -> &'static str;

    /// Reads the current state of a resource.
    ///
    /// A resource that does not exist is reported as [`ObservedState::absent`],
    /// not as an error.
    async fn read(&self, ctx: &CancellationToken, resource: &Resource) -> Result<ObservedState>;

    /// Applies a diff to the target.
    async fn apply(&self, ctx: &CancellationToken, resource: &Resource, diff: &ResourceDiff) -> Result<()>;
}

/// Registry mapping resource type names to providers.
///
/// Populated before a cycle starts, then shared read-only behind an `Arc`.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider under its resource type.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider is already registered for the type.
    pub fn register(&mut self, provider: Arc<dyn Provider>) -> Result<()> {
        let resource_type = provider.resource_type().to_string();
        if self.providers.contains_key(&resource_type) {
            return Err(ProviderError::DuplicateType { resource_type }.into());
        }
        debug!("Registered provider for '{resource_type}'");
        self.providers.insert(resource_type, provider);
        Ok(())
    }

    /// Looks up the provider for a resource type.
    ///
    /// # Errors
    ///
    /// Returns an error if no provider is registered for the type.
    pub fn get(&self, resource_type: &str) -> Result<Arc<dyn Provider>> {
        self.providers.get(resource_type).cloned().ok_or_else(|| {
            ProviderError::NotFound {
                resource_type: resource_type.to_string(),
            }
            .into()
        })
    }

    /// Returns true if a provider is registered for the type.
    #[must_use]
    pub fn contains(&self, resource_type: &str) -> bool {
        self.providers.contains_key(resource_type)
    }

    /// Registered type names, sorted.
    #[must_use]
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Number of registered providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("types", &self.types())
            .finish()
    }
}

/// Executes diffs through the providers of a registry.
#[derive(Debug, Clone)]
pub struct RegistryApplier {
    registry: Arc<ProviderRegistry>,
}

impl RegistryApplier {
    /// Wraps a shared registry.
    #[must_use]
    pub const fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl DiffApplier for RegistryApplier {
    async fn read_snapshot(&self, ctx: &CancellationToken, diff: &ResourceDiff) -> Result<ObservedState> {
        let provider = self.registry.get(&diff.resource.resource_type)?;
        provider.read(ctx, &diff.resource).await
    }

    async fn apply(&self, ctx: &CancellationToken, diff: &ResourceDiff) -> Result<()> {
        let provider = self.registry.get(&diff.resource.resource_type)?;
        provider.apply(ctx, &diff.resource, diff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeelError;
    use crate::provider::MemoryProvider;

    #[test]
    fn test_register_and_get() {
        let mut registry = ProviderRegistry::new();
        registry
            .register(Arc::new(MemoryProvider::new("package")))
            .expect("register failed");

        assert!(registry.contains("package"));
        assert_eq!(registry.get("package").unwrap().resource_type(), "package");
        assert_eq!(registry.types(), vec!["package"]);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(MemoryProvider::new("file"))).unwrap();

        let result = registry.register(Arc::new(MemoryProvider::new("file")));
        assert!(matches!(
            result,
            Err(KeelError::Provider(ProviderError::DuplicateType { .. }))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_missing_type_fails() {
        let registry = ProviderRegistry::new();
        let result = registry.get("service");
        assert!(matches!(
            result,
            Err(KeelError::Provider(ProviderError::NotFound { ref resource_type })) if resource_type == "service"
        ));
    }
}
