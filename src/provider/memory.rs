//! In-process provider.
//!
//! Keeps resources in memory and assigns ids of the form `<type>-<n>`. Outputs
//! echo the properties plus `id`. Failures can be injected per operation and
//! resource type, and every call is logged, which makes it the provider of
//! choice for tests and dry simulations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ProviderError;

use super::{CreatedResource, Outputs, Properties, Provider};

/// Provider operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderOp {
    /// `create_resource`.
    Create,
    /// `update_resource`.
    Update,
    /// `delete_resource`.
    Delete,
}

/// One logged provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCall {
    /// Operation.
    pub op: ProviderOp,
    /// Resource type.
    pub resource_type: String,
    /// Provider id; for creates, the id that was assigned (if any).
    pub provider_id: Option<String>,
    /// Properties passed, for creates and updates.
    pub properties: Option<Properties>,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    error: ProviderError,
    /// Remaining occurrences; `None` fails forever.
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct Inner {
    resources: BTreeMap<String, (String, Properties)>,
    counters: BTreeMap<String, u64>,
    failures: BTreeMap<(ProviderOp, String), InjectedFailure>,
    calls: Vec<ProviderCall>,
}

/// In-memory provider.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    inner: Mutex<Inner>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call take at least `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fails `op` on `resource_type` with `error`, `times` times or forever.
    pub async fn fail(&self, op: ProviderOp, resource_type: &str, error: ProviderError, times: Option<u32>) {
        self.inner.lock().await.failures.insert(
            (op, resource_type.to_string()),
            InjectedFailure {
                error,
                remaining: times,
            },
        );
    }

    /// Clears every injected failure.
    pub async fn clear_failures(&self) {
        self.inner.lock().await.failures.clear();
    }

    /// Returns every call made so far, in order.
    pub async fn calls(&self) -> Vec<ProviderCall> {
        self.inner.lock().await.calls.clone()
    }

    /// Returns the calls made for one resource type.
    pub async fn calls_for(&self, resource_type: &str) -> Vec<ProviderCall> {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.resource_type == resource_type)
            .cloned()
            .collect()
    }

    /// Returns the live resources: provider id to `(type, properties)`.
    pub async fn resources(&self) -> BTreeMap<String, (String, Properties)> {
        self.inner.lock().await.resources.clone()
    }

    /// Highest number of calls that were in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Inner {
    fn injected(&mut self, op: ProviderOp, resource_type: &str) -> Option<ProviderError> {
        let key = (op, resource_type.to_string());
        let failure = self.failures.get_mut(&key)?;
        let error = failure.error.clone();
        let exhausted = match &mut failure.remaining {
            None => false,
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
        };
        if exhausted {
            self.failures.remove(&key);
        }
        Some(error)
    }

    fn log(&mut self, op: ProviderOp, resource_type: &str, provider_id: Option<String>, properties: Option<&Properties>) {
        self.calls.push(ProviderCall {
            op,
            resource_type: resource_type.to_string(),
            provider_id,
            properties: properties.cloned(),
        });
    }
}

fn echo_outputs(provider_id: &str, properties: &Properties) -> Outputs {
    let mut outputs = properties.clone();
    outputs.insert(String::from("id"), Value::String(provider_id.to_string()));
    outputs
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn create_resource(
        &self,
        resource_type: &str,
        properties: &Properties,
    ) -> Result<CreatedResource, ProviderError> {
        self.enter().await;
        let mut inner = self.inner.lock().await;

        let result = if let Some(error) = inner.injected(ProviderOp::Create, resource_type) {
            inner.log(ProviderOp::Create, resource_type, None, Some(properties));
            Err(error)
        } else {
            let counter = inner.counters.entry(resource_type.to_string()).or_insert(0);
            *counter += 1;
            let provider_id = format!("{resource_type}-{counter}");
            inner
                .resources
                .insert(provider_id.clone(), (resource_type.to_string(), properties.clone()));
            inner.log(ProviderOp::Create, resource_type, Some(provider_id.clone()), Some(properties));
            debug!("Memory provider created {provider_id}");
            Ok(CreatedResource {
                outputs: echo_outputs(&provider_id, properties),
                provider_id,
            })
        };

        drop(inner);
        self.leave();
        result
    }

    async fn update_resource(
        &self,
        resource_type: &str,
        provider_id: &str,
        properties: &Properties,
    ) -> Result<Outputs, ProviderError> {
        self.enter().await;
        let mut inner = self.inner.lock().await;
        inner.log(ProviderOp::Update, resource_type, Some(provider_id.to_string()), Some(properties));

        let result = if let Some(error) = inner.injected(ProviderOp::Update, resource_type) {
            Err(error)
        } else if let Some(entry) = inner.resources.get_mut(provider_id) {
            entry.1 = properties.clone();
            Ok(echo_outputs(provider_id, properties))
        } else {
            Err(ProviderError::permanent(format!("{resource_type} {provider_id} not found")))
        };

        drop(inner);
        self.leave();
        result
    }

    async fn delete_resource(&self, resource_type: &str, provider_id: &str) -> Result<(), ProviderError> {
        self.enter().await;
        let mut inner = self.inner.lock().await;
        inner.log(ProviderOp::Delete, resource_type, Some(provider_id.to_string()), None);

        let result = match inner.injected(ProviderOp::Delete, resource_type) {
            Some(error) => Err(error),
            None => {
                inner.resources.remove(provider_id);
                Ok(())
            }
        };

        drop(inner);
        self.leave();
        result
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
