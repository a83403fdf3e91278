//! Module validation.
//!
//! Modules are validated before they reach the planner. Validation collects
//! every problem it finds; the first error is returned as a
//! [`ConfigError`], the full list is available on [`ValidationResult`].

use crate::error::{ConfigError, KeelError, Result};
use crate::model::{Module, ResourceId};
use std::collections::HashSet;
use tracing::debug;

/// Validator for modules.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModuleValidator;

/// Validation result containing every problem found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
    /// Structured error, when one applies.
    kind: Option<ConfigError>,
}

impl ModuleValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a module.
    ///
    /// # Errors
    ///
    /// Returns the first problem found if validation fails.
    pub fn validate(&self, module: &Module) -> Result<ValidationResult> {
        let result = self.check(module);

        if result.errors.is_empty() {
            debug!("Module {} passed validation", module.name);
            return Ok(result);
        }

        let mut errors = result.errors;
        let first = errors.swap_remove(0);
        Err(KeelError::Config(first.kind.unwrap_or(ConfigError::ValidationError {
            message: first.message,
            field: Some(first.field),
        })))
    }

    /// Collects every problem without failing.
    #[must_use]
    pub fn check(&self, module: &Module) -> ValidationResult {
        let mut result = ValidationResult::default();

        if module.name.trim().is_empty() {
            result.push("name", "Module name cannot be empty");
        }
        if module.version.trim().is_empty() {
            result.push("version", "Module version cannot be empty");
        }
        if module.resources.is_empty() {
            result
                .warnings
                .push(format!("Module '{}' declares no resources", module.name));
            return result;
        }

        let mut seen: HashSet<ResourceId> = HashSet::new();
        for (i, resource) in module.resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !is_valid_type(&resource.resource_type) {
                result.push(
                    format!("{prefix}.type"),
                    format!(
                        "Resource type '{}' is invalid. Must be lowercase alphanumeric with underscores.",
                        resource.resource_type
                    ),
                );
            }
            if !is_valid_name(&resource.name) {
                result.push(
                    format!("{prefix}.name"),
                    format!("Resource name '{}' is invalid", resource.name),
                );
            }

            let id = resource.id();
            if !seen.insert(id.clone()) {
                result.push_kind(
                    format!("{prefix}.name"),
                    ConfigError::DuplicateResource { id: id.clone() },
                );
            }

            let mut deps = HashSet::new();
            for (j, dependency) in resource.depends_on.iter().enumerate() {
                let field = format!("{prefix}.depends_on[{j}]");
                if dependency == &id {
                    result.push(field, format!("Resource {id} depends on itself"));
                } else if module.resource(dependency).is_none() {
                    result.push_kind(
                        field,
                        ConfigError::UnknownDependency {
                            id: id.clone(),
                            dependency: dependency.clone(),
                        },
                    );
                } else if !deps.insert(dependency) {
                    result
                        .warnings
                        .push(format!("{field}: duplicate dependency on {dependency}"));
                }
            }
        }

        result
    }
}

/// Resource types are lowercase alphanumeric with underscores, starting with
/// a letter. Dots are forbidden since they separate type from name.
fn is_valid_type(resource_type: &str) -> bool {
    let mut chars = resource_type.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Names may contain anything printable except whitespace.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| !c.is_whitespace() && !c.is_control())
}

impl ValidationResult {
    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
            kind: None,
        });
    }

    fn push_kind(&mut self, field: impl Into<String>, kind: ConfigError) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: kind.to_string(),
            kind: Some(kind),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Resource;

    #[test]
    fn test_valid_type() {
        assert!(is_valid_type("package"));
        assert!(is_valid_type("systemd_unit"));
        assert!(!is_valid_type(""));
        assert!(!is_valid_type("Package"));
        assert!(!is_valid_type("pkg.deb"));
        assert!(!is_valid_type("1file"));
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("nginx"));
        assert!(is_valid_name("/etc/nginx/nginx.conf"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("two words"));
    }

    #[test]
    fn test_valid_module() {
        let module = Module::new("web", "1.0.0")
            .with_resource(Resource::new("package", "nginx"))
            .with_resource(Resource::new("service", "nginx").depends_on(ResourceId::new("package", "nginx")));

        let result = ModuleValidator::new().validate(&module).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_empty_module_warns() {
        let result = ModuleValidator::new()
            .validate(&Module::new("empty", "1.0.0"))
            .unwrap();
        assert_eq!(result.warning_count(), 1);
    }

    #[test]
    fn test_duplicate_resource() {
        let module = Module::new("web", "1.0.0")
            .with_resource(Resource::new("file", "a"))
            .with_resource(Resource::new("file", "a"));

        let err = ModuleValidator::new().validate(&module).unwrap_err();
        assert!(matches!(
            err,
            KeelError::Config(ConfigError::DuplicateResource { .. })
        ));
    }

    #[test]
    fn test_unknown_and_self_dependency() {
        let module = Module::new("web", "1.0.0")
            .with_resource(Resource::new("service", "app").depends_on(ResourceId::new("package", "missing")))
            .with_resource(Resource::new("file", "conf").depends_on(ResourceId::new("file", "conf")));

        let result = ModuleValidator::new().check(&module);
        assert_eq!(result.error_count(), 2);
        assert!(result.errors[0].message.contains("package.missing"));
        assert!(result.errors[1].message.contains("depends on itself"));

        let err = ModuleValidator::new().validate(&module).unwrap_err();
        assert!(matches!(
            err,
            KeelError::Config(ConfigError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_collects_all_errors() {
        let module = Module::new("", "1.0.0")
            .with_resource(Resource::new("Bad.Type", "x"))
            .with_resource(Resource::new("file", "has space"));

        let result = ModuleValidator::new().check(&module);
        assert_eq!(result.error_count(), 3);
        assert_eq!(result.errors[0].field, "name");
    }
}
