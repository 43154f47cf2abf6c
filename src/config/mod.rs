//! Stack document handling.
//!
//! This module handles everything about the stack document:
//! - Parsing `halyard.stack.yaml` (or JSON) with environment overrides
//! - Validation of document-level settings
//! - Property hashing for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, PROVIDER_TOKEN_VAR, find_config_file};
pub use spec::{
    ExecutionConfig, ProjectConfig, ProviderConfig, ProviderKind, ReplaceStrategy, ResourceSpec,
    StackSpec, StateBackend, StateConfig, TypeCapabilities,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
