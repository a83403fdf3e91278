//! Resources, modules and observed state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::value::Value;

/// Property map of a resource, ordered by key.
pub type Properties = BTreeMap<String, Value>;

/// Deterministic identifier of a resource: `type.name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Builds the id of a resource from its type and name.
    #[must_use]
    pub fn new(resource_type: &str, name: &str) -> Self {
        Self(format!("{resource_type}.{name}"))
    }

    /// Parses an id of the form `type.name`.
    ///
    /// The type is everything before the first dot, so names may contain dots.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let (resource_type, name) = value.split_once('.')?;
        if resource_type.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self(value.to_string()))
    }

    /// Type part of the id.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        self.0.split_once('.').map_or(self.0.as_str(), |(t, _)| t)
    }

    /// Name part of the id.
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.split_once('.').map_or("", |(_, n)| n)
    }

    /// The full id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Desired lifecycle state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    /// The resource must exist with the declared properties.
    #[default]
    Present,
    /// The resource must not exist.
    Absent,
}

/// A single declared resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Provider type (e.g. `package`, `service`, `file`).
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Name, unique within its type.
    pub name: String,
    /// Desired state.
    #[serde(default)]
    pub state: ResourceState,
    /// Declared properties.
    #[serde(default)]
    pub properties: Properties,
    /// Resources that must converge before this one.
    #[serde(default)]
    pub depends_on: Vec<ResourceId>,
}

impl Resource {
    /// Creates a present resource with no properties.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            state: ResourceState::Present,
            properties: Properties::new(),
            depends_on: Vec::new(),
        }
    }

    /// Sets the desired state.
    #[must_use]
    pub const fn with_state(mut self, state: ResourceState) -> Self {
        self.state = state;
        self
    }

    /// Adds a declared property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn depends_on(mut self, id: ResourceId) -> Self {
        self.depends_on.push(id);
        self
    }

    /// The resource's id.
    #[must_use]
    pub fn id(&self) -> ResourceId {
        ResourceId::new(&self.resource_type, &self.name)
    }
}

/// A named, versioned collection of resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// Module name.
    pub name: String,
    /// Module version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Free-form labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Resources in declaration order.
    #[serde(default)]
    pub resources: Vec<Resource>,
}

fn default_version() -> String {
    String::from("0.0.0")
}

impl Module {
    /// Creates an empty module.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            labels: BTreeMap::new(),
            resources: Vec::new(),
        }
    }

    /// Appends a resource.
    #[must_use]
    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resources.push(resource);
        self
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Looks up a resource by id.
    #[must_use]
    pub fn resource(&self, id: &ResourceId) -> Option<&Resource> {
        self.resources
            .iter()
            .find(|r| r.resource_type == id.resource_type() && r.name == id.name())
    }

    /// Returns the number of declared resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if the module declares no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// State of a resource as read by its provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ObservedState {
    /// Whether the resource exists on the target.
    pub present: bool,
    /// Observed properties.
    #[serde(default)]
    pub properties: Properties,
}

impl ObservedState {
    /// State of a resource that does not exist.
    #[must_use]
    pub fn absent() -> Self {
        Self {
            present: false,
            properties: Properties::new(),
        }
    }

    /// State of an existing resource with the given properties.
    #[must_use]
    pub const fn present(properties: Properties) -> Self {
        Self {
            present: true,
            properties,
        }
    }
}
