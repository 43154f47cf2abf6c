//! Stack document parser.
//!
//! Loads the stack document from YAML or JSON and applies environment
//! variable overrides on top of it.

use crate::error::{ConfigError, HalyardError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::StackSpec;

/// Environment variable holding the provider bearer token.
pub const PROVIDER_TOKEN_VAR: &str = "HALYARD_PROVIDER_TOKEN";

/// Parser for stack documents.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving the `.env` file.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a stack document. Files ending in `.json` are read as JSON,
    /// anything else as YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackSpec> {
        let path = path.as_ref();
        info!("Loading stack from: {}", path.display());

        if !path.exists() {
            return Err(HalyardError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            HalyardError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        if path.extension().is_some_and(|ext| ext == "json") {
            self.parse_json(&content, Some(path))
        } else {
            self.parse_yaml(&content, Some(path))
        }
    }

    /// Parses a stack document from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackSpec> {
        debug!("Parsing YAML stack document");

        let stack: StackSpec = serde_yaml::from_str(content).map_err(|e| {
            HalyardError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })?;

        debug!(
            "Parsed stack for project {} with {} resources",
            stack.project.name,
            stack.resources.len()
        );
        Ok(stack)
    }

    /// Parses a stack document from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid.
    pub fn parse_json(&self, content: &str, source: Option<&Path>) -> Result<StackSpec> {
        debug!("Parsing JSON stack document");

        serde_json::from_str(content).map_err(|e| {
            HalyardError::Config(ConfigError::ParseError {
                message: format!("JSON parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })
    }

    /// Loads a stack document and applies environment overrides.
    ///
    /// Overrides use the form `HALYARD_<SECTION>_<KEY>`, for example
    /// `HALYARD_PROJECT_NAME` or `HALYARD_STATE_BUCKET`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// holds a value of the wrong shape.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackSpec> {
        let mut stack = self.load_file(path)?;
        Self::apply_env_overrides(&mut stack)?;
        Ok(stack)
    }

    /// Applies environment variable overrides to a stack document.
    fn apply_env_overrides(stack: &mut StackSpec) -> Result<()> {
        if let Ok(name) = std::env::var("HALYARD_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            stack.project.name = name;
        }

        if let Ok(env) = std::env::var("HALYARD_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            stack.project.environment = env;
        }

        if let Ok(bucket) = std::env::var("HALYARD_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            stack.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("HALYARD_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            stack.state.prefix = Some(prefix);
        }

        if let Ok(endpoint) = std::env::var("HALYARD_PROVIDER_ENDPOINT") {
            debug!("Overriding provider.endpoint from environment");
            stack.provider.endpoint = Some(endpoint);
        }

        if let Ok(raw) = std::env::var("HALYARD_CONCURRENCY") {
            debug!("Overriding execution.concurrency from environment");
            stack.execution.concurrency = raw.parse().map_err(|_| {
                HalyardError::Config(ConfigError::validation(
                    format!("HALYARD_CONCURRENCY must be a positive integer, got '{raw}'"),
                    "execution.concurrency",
                ))
            })?;
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                HalyardError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Gets the provider bearer token from environment (optional).
    #[must_use]
    pub fn provider_token() -> Option<String> {
        std::env::var(PROVIDER_TOKEN_VAR).ok().filter(|t| !t.is_empty())
    }
}

/// Default stack file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "halyard.stack.yaml",
    "halyard.stack.yml",
    "halyard.stack.json",
];

/// Finds the stack file in the given directory or its ancestors.
///
/// # Errors
///
/// Returns an error if no stack file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found stack file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(HalyardError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}
