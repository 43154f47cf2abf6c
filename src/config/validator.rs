//! Stack document validation.
//!
//! Checks the document-level settings (project, state backend, provider,
//! execution limits, type table) before any graph is built. Structural checks
//! on resources themselves (ids, references, cycles) belong to the graph
//! builder.

use crate::error::{ConfigError, HalyardError, Result};
use crate::state::LOCK_EXPIRY_SECS;
use std::collections::BTreeSet;
use tracing::debug;

use super::spec::{ExecutionConfig, ProjectConfig, ProviderConfig, ProviderKind, StackSpec, StateBackend, StateConfig};

/// Validator for stack documents.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
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
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack document.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any check fails.
    pub fn validate(&self, stack: &StackSpec) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_project(&stack.project, &mut result);
        Self::validate_state(&stack.state, &mut result);
        Self::validate_provider(&stack.provider, &mut result);
        Self::validate_execution(&stack.execution, &mut result);
        Self::validate_types(stack, &mut result);

        if stack.resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in stack"));
        }

        if let Some(first_error) = result.errors.first() {
            return Err(HalyardError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }));
        }

        debug!("Stack validation passed");
        Ok(result)
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.push_error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.push_error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.push_error("project.environment", "Environment cannot be empty");
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.push_error(
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

    fn validate_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        match provider.kind {
            ProviderKind::Http => match provider.endpoint.as_deref() {
                None | Some("") => result.push_error(
                    "provider.endpoint",
                    "Provider endpoint is required for the http provider",
                ),
                Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                    result.push_error(
                        "provider.endpoint",
                        format!("Provider endpoint '{url}' must be an http(s) URL"),
                    );
                }
                Some(_) => {}
            },
            ProviderKind::Memory => {
                result.warnings.push(String::from(
                    "provider.kind is memory: nothing will be provisioned outside this process",
                ));
            }
        }

        if provider.request_timeout_secs == 0 {
            result.push_error(
                "provider.request_timeout_secs",
                "Request timeout must be at least 1 second",
            );
        }
    }

    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        if execution.concurrency == 0 {
            result.push_error("execution.concurrency", "Concurrency must be at least 1");
        }

        if execution.max_attempts == 0 {
            result.push_error("execution.max_attempts", "At least one attempt is required");
        }

        if execution.initial_backoff_ms > execution.max_backoff_ms {
            result.push_error(
                "execution.initial_backoff_ms",
                format!(
                    "Initial backoff ({} ms) exceeds maximum backoff ({} ms)",
                    execution.initial_backoff_ms, execution.max_backoff_ms
                ),
            );
        }

        if execution.call_timeout_secs == 0 {
            result.push_error(
                "execution.call_timeout_secs",
                "Call timeout must be at least 1 second",
            );
        } else if !i64::try_from(execution.call_timeout_secs).is_ok_and(|t| t < LOCK_EXPIRY_SECS) {
            // A single call must end before an unrefreshed lock could expire.
            result.push_error(
                "execution.call_timeout_secs",
                format!(
                    "Call timeout ({}s) must be below the state lock expiry ({LOCK_EXPIRY_SECS}s)",
                    execution.call_timeout_secs
                ),
            );
        }
    }

    fn validate_types(stack: &StackSpec, result: &mut ValidationResult) {
        let used: BTreeSet<&str> = stack
            .resources
            .iter()
            .map(|r| r.resource_type.as_str())
            .collect();

        for (name, caps) in &stack.types {
            if caps.immutable.iter().any(String::is_empty) {
                result.push_error(
                    format!("types.{name}.immutable"),
                    "Immutable property names cannot be empty",
                );
            }

            if !used.contains(name.as_str()) {
                result
                    .warnings
                    .push(format!("types.{name}: no resource uses this type"));
            }

            if !caps.immutable.is_empty() && caps.replace.is_none() {
                result.warnings.push(format!(
                    "types.{name}: immutable properties declared without a replace strategy; changing them will fail to plan"
                ));
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

impl ValidationResult {
    fn push_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
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
    use crate::config::{ResourceSpec, TypeCapabilities};
    use std::collections::BTreeMap;

    fn stack() -> StackSpec {
        StackSpec {
            project: ProjectConfig {
                name: String::from("edge"),
                environment: String::from("dev"),
            },
            state: StateConfig::default(),
            provider: ProviderConfig {
                endpoint: Some(String::from("http://localhost:8080")),
                ..ProviderConfig::default()
            },
            execution: ExecutionConfig::default(),
            types: BTreeMap::new(),
            resources: vec![ResourceSpec::new("vpc", "network")],
        }
    }

    fn failed_field(stack: &StackSpec) -> Option<String> {
        match ConfigValidator::new().validate(stack) {
            Err(HalyardError::Config(ConfigError::ValidationError { field, .. })) => field,
            _ => None,
        }
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("edge"));
        assert!(is_valid_name("my-stack-123"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Edge"));
        assert!(!is_valid_name("1edge"));
        assert!(!is_valid_name("edge-"));
        assert!(!is_valid_name("edge--net"));
    }

    #[test]
    fn test_valid_stack_passes() {
        let result = ConfigValidator::new().validate(&stack()).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_s3_requires_bucket() {
        let mut s = stack();
        s.state.backend = StateBackend::S3;
        assert_eq!(failed_field(&s).as_deref(), Some("state.bucket"));
    }

    #[test]
    fn test_http_requires_endpoint() {
        let mut s = stack();
        s.provider.endpoint = None;
        assert_eq!(failed_field(&s).as_deref(), Some("provider.endpoint"));

        s.provider.endpoint = Some(String::from("ftp://host"));
        assert_eq!(failed_field(&s).as_deref(), Some("provider.endpoint"));
    }

    #[test]
    fn test_execution_limits() {
        let mut s = stack();
        s.execution.concurrency = 0;
        assert_eq!(failed_field(&s).as_deref(), Some("execution.concurrency"));

        let mut s = stack();
        s.execution.initial_backoff_ms = 60_000;
        assert_eq!(failed_field(&s).as_deref(), Some("execution.initial_backoff_ms"));
    }

    #[test]
    fn test_call_timeout_below_lock_expiry() {
        let mut s = stack();
        s.execution.call_timeout_secs = 300;
        assert_eq!(failed_field(&s).as_deref(), Some("execution.call_timeout_secs"));

        s.execution.call_timeout_secs = 0;
        assert_eq!(failed_field(&s).as_deref(), Some("execution.call_timeout_secs"));

        s.execution.call_timeout_secs = 299;
        assert!(ConfigValidator::new().validate(&s).is_ok());
    }

    #[test]
    fn test_type_warnings() {
        let mut s = stack();
        s.types.insert(
            String::from("network"),
            TypeCapabilities {
                immutable: BTreeSet::from([String::from("cidr")]),
                replace: None,
            },
        );
        s.types.insert(String::from("unused"), TypeCapabilities::default());

        let result = ConfigValidator::new().validate(&s).unwrap();
        assert_eq!(result.warning_count(), 2);
    }
}
