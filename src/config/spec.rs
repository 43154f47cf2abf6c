//! Stack document types.
//!
//! This module defines the structs that map to `halyard.stack.yaml`. The
//! document fully describes the desired state: which resources exist, how the
//! provider is reached, where state lives, and how each resource type behaves
//! when it has to be replaced.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// The root stack document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackSpec {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider connection configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Executor tuning.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Per-type capabilities, keyed by resource type.
    #[serde(default)]
    pub types: BTreeMap<String, TypeCapabilities>,
    /// Resources to provision.
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provider connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Which provider implementation to use.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Base URL of the provider endpoint (for the http provider).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// HTTP request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Provider implementations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// JSON-over-HTTP provider service.
    #[default]
    Http,
    /// In-process simulation; nothing leaves the machine.
    Memory,
}

/// Executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Maximum number of provider calls in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Attempts per provider call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    /// Upper bound on the backoff, in milliseconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Deadline for a single provider call, in seconds.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

/// How a resource type behaves when a change cannot be applied in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypeCapabilities {
    /// Properties that can only be set at creation.
    #[serde(default)]
    pub immutable: BTreeSet<String>,
    /// Replacement ordering; required before a replace can be planned.
    #[serde(default)]
    pub replace: Option<ReplaceStrategy>,
}

/// Ordering of the two halves of a replacement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceStrategy {
    /// Destroy the old instance first (singletons, fixed names).
    DeleteBeforeCreate,
    /// Bring up the new instance first, then destroy the old one.
    CreateBeforeDelete,
}

/// A single resource declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    /// Stable, user-assigned id.
    pub id: String,
    /// Provider resource kind.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Desired properties. `{ ref: "<id>.<attribute>" }` marks a reference.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    /// Ordering-only dependencies that no property references.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            endpoint: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

// Default value functions

const fn default_request_timeout() -> u64 {
    30
}

const fn default_concurrency() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_initial_backoff() -> u64 {
    500
}

const fn default_max_backoff() -> u64 {
    30_000
}

const fn default_call_timeout() -> u64 {
    240
}

fn default_environment() -> String {
    String::from("dev")
}

impl StackSpec {
    /// Creates a stack with default settings and no resources.
    #[must_use]
    pub fn new(name: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            project: ProjectConfig {
                name: name.into(),
                environment: environment.into(),
            },
            state: StateConfig::default(),
            provider: ProviderConfig::default(),
            execution: ExecutionConfig::default(),
            types: BTreeMap::new(),
            resources: Vec::new(),
        }
    }

    /// Adds a resource declaration.
    #[must_use]
    pub fn with_resource(mut self, resource: ResourceSpec) -> Self {
        self.resources.push(resource);
        self
    }

    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns resource ids in declaration order.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.id.as_str()).collect()
    }
}

impl ResourceSpec {
    /// Creates a resource declaration with no properties.
    #[must_use]
    pub fn new(id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            properties: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    /// Sets a property value.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Adds an ordering-only dependency.
    #[must_use]
    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let spec: StackSpec = serde_yaml::from_str("project:\n  name: demo\n").unwrap();
        assert_eq!(spec.project.environment, "dev");
        assert_eq!(spec.state.backend, StateBackend::Local);
        assert_eq!(spec.provider.kind, ProviderKind::Http);
        assert_eq!(spec.execution.concurrency, 4);
        assert!(spec.resources.is_empty());
    }

    #[test]
    fn test_replace_strategy_names() {
        let caps: TypeCapabilities =
            serde_yaml::from_str("immutable: [cidr]\nreplace: create_before_delete\n").unwrap();
        assert!(caps.immutable.contains("cidr"));
        assert_eq!(caps.replace, Some(ReplaceStrategy::CreateBeforeDelete));
    }

    #[test]
    fn test_resource_builder() {
        let res = ResourceSpec::new("vpc", "network")
            .with_property("cidr", Value::from("10.0.0.0/16"))
            .with_dependency("role");
        assert_eq!(res.properties.len(), 1);
        assert_eq!(res.depends_on, vec![String::from("role")]);
    }
}
