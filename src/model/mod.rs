//! Declarative model consumed by the engine.
//!
//! A [`Module`] is a named, versioned collection of [`Resource`]s. Resources
//! carry free-form properties expressed as [`Value`]s and are addressed by a
//! deterministic [`ResourceId`] of the form `type.name`.

mod resource;
mod value;

pub use resource::{Module, ObservedState, Properties, Resource, ResourceId, ResourceState};
pub use value::Value;
