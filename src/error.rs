//! Error types for the Halyard provisioning engine.
//!
//! Errors are grouped by the phase that raises them. Configuration, graph and
//! planning errors are raised before any infrastructure is touched. Provider
//! errors are contained per resource during apply. State errors are fatal to
//! an apply because the engine cannot keep track of what it created.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for Halyard.
#[derive(Debug, Error)]
pub enum HalyardError {
    /// Stack document loading and validation errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph construction errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider call errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stack document errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The stack file was not found.
    #[error("Stack file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The stack file could not be parsed.
    #[error("Failed to parse stack document: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Stack validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },
}

/// Errors raised while assembling the resource graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// A node is malformed or points at something that does not exist.
    #[error("Invalid resource '{node}': {message}")]
    Validation {
        /// Id of the offending node.
        node: String,
        /// Description of the problem.
        message: String,
    },

    /// Two nodes share the same id.
    #[error("Duplicate resource id: {id}")]
    DuplicateId {
        /// The duplicated id.
        id: String,
    },

    /// The dependency relation contains a cycle.
    #[error("Dependency cycle detected: {}", .path.join(" -> "))]
    Cycle {
        /// Node ids along the cycle; the first id is repeated at the end.
        path: Vec<String>,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Writing to the state medium failed.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// The lock a run holds expired and was taken over, or was removed.
    #[error("State lock {lock_id} is no longer held by this run")]
    LockLost {
        /// Id of the lost lock.
        lock_id: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },
}

/// Failure reported by a provider call.
///
/// The provider decides whether the failure is transient (rate limiting,
/// throttling, timeouts) and therefore worth retrying.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ProviderError {
    /// Whether retrying the call may succeed.
    pub transient: bool,
    /// Description of the failure.
    pub message: String,
}

/// Planning errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    /// A resource must be replaced but its type declares no replace strategy.
    #[error(
        "Resource '{id}' of type '{resource_type}' must be replaced ({reason}) but the type has no replace strategy"
    )]
    ReplacePolicyMissing {
        /// Resource id.
        id: String,
        /// Resource type.
        resource_type: String,
        /// Why a replacement is required.
        reason: String,
    },
}

/// Per-resource apply errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApplyError {
    /// A dependency did not succeed, so the resource was never started.
    #[error("Skipped: dependency '{dependency}' of '{id}' did not succeed")]
    DependencyFailed {
        /// Resource that was skipped.
        id: String,
        /// Dependency that failed or was skipped.
        dependency: String,
    },

    /// The apply was cancelled before the resource started.
    #[error("Skipped: apply cancelled before '{id}' started")]
    Cancelled {
        /// Resource that was skipped.
        id: String,
    },

    /// A reference could not be resolved from its dependency's outputs.
    #[error("Resource '{id}' references missing output '{reference}'")]
    UnresolvedOutput {
        /// Resource holding the reference.
        id: String,
        /// The reference text.
        reference: String,
    },

    /// Retries were exhausted.
    #[error("Maximum attempts ({attempts}) exceeded for '{id}': {last_error}")]
    MaxAttemptsExceeded {
        /// Resource id.
        id: String,
        /// Number of attempts made.
        attempts: u32,
        /// Last provider error message.
        last_error: String,
    },
}

/// Result type alias for Halyard operations.
pub type Result<T> = std::result::Result<T, HalyardError>;

impl HalyardError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(err) => err.transient,
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns true if this error was raised before any mutation could happen.
    #[must_use]
    pub const fn is_pre_mutation(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Graph(_) | Self::Plan(_))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl GraphError {
    /// Creates a validation error for a node.
    #[must_use]
    pub fn validation(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            node: node.into(),
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a transient (retryable) provider error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            message: message.into(),
        }
    }

    /// Creates a permanent provider error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            transient: false,
            message: message.into(),
        }
    }
}
