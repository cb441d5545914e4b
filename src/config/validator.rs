//! Structural validation for stack files.
//!
//! This module checks names, backend settings, execution bounds and the
//! declared resources against the provider schemas before any graph is
//! built. Reference and cycle checks belong to the graph builder.

use crate::error::{CirrusError, ConfigError, Result};
use crate::provider::ProviderRegistry;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::spec::{ExecutionConfig, ProjectConfig, ResourceSpec, StackConfig, StateBackend, StateConfig};

/// Validator for stack configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator {
    /// Required attributes per known `(provider, type)` pair.
    known_types: HashMap<(String, String), Vec<String>>,
}

/// Validation result containing all issues found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationIssue>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationIssue {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a validator that accepts any resource type.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a validator knowing every type in the registry.
    #[must_use]
    pub fn with_registry(registry: &ProviderRegistry) -> Self {
        let mut validator = Self::new();
        for schema in registry.schemas() {
            validator.add_resource_type(
                &schema.provider,
                &schema.resource_type,
                schema.required.iter().map(String::as_str),
            );
        }
        validator
    }

    /// Registers a resource type and its required attributes.
    pub fn add_resource_type<'a>(
        &mut self,
        provider: &str,
        resource_type: &str,
        required: impl IntoIterator<Item = &'a str>,
    ) {
        self.known_types.insert(
            (provider.to_string(), resource_type.to_string()),
            required.into_iter().map(ToString::to_string).collect(),
        );
    }

    /// Validates a stack configuration.
    ///
    /// # Errors
    ///
    /// Returns the first error found; warnings never fail validation.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_execution(&config.execution, &mut result);
        self.validate_resources(&config.resources, &mut result);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(CirrusError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }
    }

    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        if execution.max_parallel == 0 {
            result.error("execution.max_parallel", "max_parallel must be at least 1");
        }

        if execution.initial_backoff_ms > execution.max_backoff_ms {
            result.error(
                "execution.initial_backoff_ms",
                format!(
                    "initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                    execution.initial_backoff_ms, execution.max_backoff_ms
                ),
            );
        }

        if execution.max_retries > 10 {
            result.warnings.push(format!(
                "execution.max_retries: {} retries may stall an apply for a long time",
                execution.max_retries
            ));
        }
    }

    fn validate_resources(&self, resources: &[ResourceSpec], result: &mut ValidationResult) {
        if resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in configuration"));
            return;
        }

        let mut seen = HashSet::new();

        for (i, spec) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            for (field, value) in [
                ("provider", &spec.provider),
                ("type", &spec.resource_type),
                ("name", &spec.name),
            ] {
                if !is_valid_identifier(value) {
                    result.error(
                        format!("{prefix}.{field}"),
                        format!(
                            "{field} '{value}' is invalid. Must start with a lowercase letter and contain only lowercase alphanumerics, '_' or '-'."
                        ),
                    );
                }
            }

            let id = spec.id();
            if !seen.insert(id.clone()) {
                result.error(format!("{prefix}.name"), format!("Duplicate resource: {id}"));
            }

            if self.known_types.is_empty() {
                continue;
            }

            match self
                .known_types
                .get(&(spec.provider.clone(), spec.resource_type.clone()))
            {
                Some(required) => {
                    for key in required {
                        if !spec.attributes.contains_key(key) {
                            result.error(
                                format!("{prefix}.attributes.{key}"),
                                format!("{id} is missing required attribute '{key}'"),
                            );
                        }
                    }
                }
                None => result.error(
                    format!("{prefix}.type"),
                    format!(
                        "No provider registered for {}.{} (used by {id})",
                        spec.provider, spec.resource_type
                    ),
                ),
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Like [`is_valid_name`] but also admits underscores, as resource
/// types and names conventionally use them.
fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationIssue {
            field: field.into(),
            message: message.into(),
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

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> StackConfig {
        ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("should parse")
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("web-stack"));
        assert!(is_valid_name("stack-123"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Web-Stack")); // uppercase
        assert!(!is_valid_name("123-stack")); // starts with number
        assert!(!is_valid_name("web_stack")); // underscore
        assert!(!is_valid_name("stack-")); // ends with hyphen
        assert!(!is_valid_name("web--stack")); // consecutive hyphens
    }

    #[test]
    fn test_identifier_allows_underscore() {
        assert!(is_valid_identifier("s3_bucket"));
        assert!(!is_valid_identifier("web.server"));
        assert!(!is_valid_identifier("_private"));
    }

    #[test]
    fn test_duplicate_resource_rejected() {
        let config = parse(
            r"
project: { name: dup }
resources:
  - { provider: aws, type: instance, name: web }
  - { provider: aws, type: instance, name: web }
",
        );
        let result = ConfigValidator::new().validate(&config);
        assert!(matches!(
            result,
            Err(CirrusError::Config(ConfigError::ValidationError { .. }))
        ));
    }

    #[test]
    fn test_unknown_type_and_required_attribute() {
        let config = parse(
            r"
project: { name: typed }
resources:
  - { provider: aws, type: instance, name: web, attributes: { ami: ami-1 } }
  - { provider: aws, type: lambda, name: fn }
",
        );
        let mut validator = ConfigValidator::new();
        validator.add_resource_type("aws", "instance", ["ami", "instance_type"]);

        let mut result = ValidationResult::default();
        validator.validate_resources(&config.resources, &mut result);

        assert_eq!(result.error_count(), 2);
        assert!(result.errors[0].message.contains("instance_type"));
        assert!(result.errors[1].message.contains("aws.lambda"));
    }

    #[test]
    fn test_s3_backend_requires_bucket() {
        let config = parse(
            r"
project: { name: remote }
state: { backend: s3 }
",
        );
        let err = ConfigValidator::new()
            .validate(&config)
            .expect_err("bucket is required");
        assert!(err.to_string().contains("bucket"));
    }

    #[test]
    fn test_execution_bounds() {
        let config = parse(
            r"
project: { name: exec }
execution: { max_parallel: 0 }
",
        );
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_empty_resources_warns() {
        let config = parse("project: { name: empty }\n");
        let result = ConfigValidator::new()
            .validate(&config)
            .expect("should pass");
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 1);
    }
}
