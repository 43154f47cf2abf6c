//! Provider abstraction.
//!
//! A provider performs the actual create, update and delete calls against the
//! infrastructure. The engine only ever talks to the [`Provider`] trait; the
//! HTTP implementation speaks a small JSON protocol, the memory
//! implementation simulates one in-process.

mod http;
mod memory;
mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{ConfigParser, ProviderConfig, ProviderKind};
use crate::error::{ConfigError, HalyardError, ProviderError, Result};

pub use http::HttpProvider;
pub use memory::{MemoryProvider, ProviderCall, ProviderOp};
pub use retry::{Attempted, RetryPolicy};

/// Resolved properties sent to a provider.
pub type Properties = BTreeMap<String, Value>;

/// Output attributes a provider reports for a resource.
pub type Outputs = BTreeMap<String, Value>;

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedResource {
    /// Id the provider assigned.
    pub provider_id: String,
    /// Output attributes of the new resource.
    #[serde(default)]
    pub outputs: Outputs,
}

/// Interface to the infrastructure being provisioned.
///
/// Properties passed here are fully resolved: every reference has already
/// been replaced by the referenced value.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates a resource.
    async fn create_resource(
        &self,
        resource_type: &str,
        properties: &Properties,
    ) -> std::result::Result<CreatedResource, ProviderError>;

    /// Updates a resource in place and returns its new outputs.
    async fn update_resource(
        &self,
        resource_type: &str,
        provider_id: &str,
        properties: &Properties,
    ) -> std::result::Result<Outputs, ProviderError>;

    /// Deletes a resource. Deleting a resource that no longer exists succeeds.
    async fn delete_resource(
        &self,
        resource_type: &str,
        provider_id: &str,
    ) -> std::result::Result<(), ProviderError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Builds the provider a stack document asks for.
///
/// # Errors
///
/// Returns an error if the http provider has no endpoint or its client
/// cannot be built.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
    match config.kind {
        ProviderKind::Http => {
            let endpoint = config.endpoint.as_deref().ok_or_else(|| {
                HalyardError::Config(ConfigError::validation(
                    "Provider endpoint is required for the http provider",
                    "provider.endpoint",
                ))
            })?;
            let provider = HttpProvider::new(
                endpoint,
                config.request_timeout_secs,
                ConfigParser::provider_token(),
            )?;
            Ok(Arc::new(provider))
        }
        ProviderKind::Memory => Ok(Arc::new(MemoryProvider::new())),
    }
}
