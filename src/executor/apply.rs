//! Concurrent plan executor.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, ReplaceStrategy};
use crate::error::{ApplyError, HalyardError, ProviderError};
use crate::model::{Reference, ResourceNode, resolve};
use crate::planner::{ChangeAction, Plan, PlannedChange};
use crate::provider::{Outputs, Properties, Provider, RetryPolicy};
use crate::state::{StateJournal, StateRecord, StateSnapshot, StateStore};

use super::cancel::CancelHandle;
use super::status::{ApplyResult, NodeOutcome, NodeStatus};

/// Completion signal published by every change task.
#[derive(Debug, Clone)]
enum Progress {
    /// Not done yet.
    Pending,
    /// New instance is live and committed; cleanup of the old one is pending.
    Available(Arc<Outputs>),
    /// Terminal. Carries outputs on success.
    Finished(Option<Arc<Outputs>>),
}

impl Progress {
    const fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    const fn is_finished(&self) -> bool {
        matches!(self, Self::Finished(_))
    }

    fn outputs(&self) -> Option<Arc<Outputs>> {
        match self {
            Self::Available(outputs) | Self::Finished(Some(outputs)) => Some(Arc::clone(outputs)),
            Self::Pending | Self::Finished(None) => None,
        }
    }
}

/// Why a change did not succeed.
enum Failure {
    Skipped(ApplyError),
    Failed(String),
}

/// Changes a task has to wait for, computed once per apply.
#[derive(Debug, Default)]
struct Waits {
    /// Desired-graph dependencies.
    dependencies: Vec<String>,
    /// Changes whose desired node depends on this one.
    dependents: Vec<String>,
    /// Changes whose prior record depends on this one.
    prior_dependents: Vec<String>,
}

/// State shared by every task of one apply.
struct Shared {
    provider: Arc<dyn Provider>,
    journal: StateJournal,
    retry: RetryPolicy,
    permits: Semaphore,
    cancel: CancelHandle,
    signals: HashMap<String, watch::Receiver<Progress>>,
    upserts: Vec<String>,
    fatal: OnceLock<String>,
}

impl Shared {
    /// Waits until the signal of `id` satisfies `ready`.
    ///
    /// A task that went away without signalling counts as failed.
    async fn wait_for(&self, id: &str, ready: fn(&Progress) -> bool) -> Progress {
        let Some(rx) = self.signals.get(id) else {
            return Progress::Finished(None);
        };
        let mut rx = rx.clone();
        match rx.wait_for(ready).await {
            Ok(progress) => Progress::clone(&progress),
            Err(_) => Progress::Finished(None),
        }
    }

    /// Records a state store failure and cancels the rest of the apply.
    fn abort(&self, id: &str, err: &HalyardError) -> Failure {
        error!("State store failed while committing '{id}', cancelling apply: {err}");
        if self.fatal.set(err.to_string()).is_err() {
            debug!("Apply already aborted, keeping the first state store error");
        }
        self.cancel.cancel();
        Failure::Failed(err.to_string())
    }
}

/// Applies plans against a provider and a state store.
pub struct PlanExecutor {
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    retry: RetryPolicy,
    concurrency: usize,
    cancel: CancelHandle,
}

impl PlanExecutor {
    /// Creates an executor with the default retry policy and concurrency.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, store: Arc<dyn StateStore>) -> Self {
        Self {
            provider,
            store,
            retry: RetryPolicy::default(),
            concurrency: 4,
            cancel: CancelHandle::new(),
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the maximum number of provider calls in flight. Zero means one.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Uses an externally owned cancellation handle.
    #[must_use]
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns a handle that cancels this executor's applies.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Applies `plan`, computed from the `prior` snapshot.
    ///
    /// Failures are contained per change: dependents of a failed change are
    /// skipped, independent branches keep going, and nothing is rolled back.
    pub async fn apply(&self, plan: &Plan, prior: &StateSnapshot) -> ApplyResult {
        let started = Instant::now();
        let pending = plan.changes.iter().filter(|c| c.action != ChangeAction::NoOp).count();
        info!(
            "Applying {pending} change(s) over {} resource(s), concurrency {}",
            plan.changes.len(),
            self.concurrency
        );

        let mut senders = Vec::with_capacity(plan.changes.len());
        let mut signals = HashMap::with_capacity(plan.changes.len());
        for change in &plan.changes {
            let (tx, rx) = watch::channel(Progress::Pending);
            senders.push(tx);
            signals.insert(change.id.clone(), rx);
        }

        let shared = Arc::new(Shared {
            provider: Arc::clone(&self.provider),
            journal: StateJournal::new(Arc::clone(&self.store)),
            retry: self.retry,
            permits: Semaphore::new(self.concurrency),
            cancel: self.cancel.clone(),
            signals,
            upserts: plan
                .changes
                .iter()
                .filter(|c| c.action != ChangeAction::Delete)
                .map(|c| c.id.clone())
                .collect(),
            fatal: OnceLock::new(),
        });

        let mut tasks = JoinSet::new();
        let waits = plan_waits(plan, prior);
        for (index, ((change, signal), waits)) in plan.changes.iter().zip(senders).zip(waits).enumerate() {
            let task = Task {
                shared: Arc::clone(&shared),
                prior: prior.get(&change.id).or(change.prior.as_ref()).cloned(),
                change: change.clone(),
                waits,
                signal,
                outcome: NodeOutcome::pending(change),
                started: None,
                dependency_ids: BTreeMap::new(),
            };
            tasks.spawn(async move { (index, task.run().await) });
        }

        let mut outcomes: Vec<Option<NodeOutcome>> = vec![None; plan.changes.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    if let Some(slot) = outcomes.get_mut(index) {
                        *slot = Some(outcome);
                    }
                }
                Err(e) => error!("Apply task terminated abnormally: {e}"),
            }
        }

        let outcomes: Vec<NodeOutcome> = outcomes
            .into_iter()
            .zip(&plan.changes)
            .map(|(outcome, change)| {
                outcome.unwrap_or_else(|| NodeOutcome::aborted(change, "task terminated before reporting"))
            })
            .collect();

        let result = ApplyResult {
            outcomes,
            deltas: shared.journal.deltas().await,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            cancelled: shared.cancel.is_cancelled(),
            fatal_error: shared.fatal.get().cloned(),
        };

        info!(
            "Apply finished in {}ms: {} succeeded, {} failed, {} skipped",
            result.elapsed_ms,
            result.count(NodeStatus::Succeeded),
            result.count(NodeStatus::Failed),
            result.count(NodeStatus::Skipped)
        );
        result
    }
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("provider", &self.provider.name())
            .field("store", &self.store.backend_type())
            .field("retry", &self.retry)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

fn plan_waits(plan: &Plan, prior: &StateSnapshot) -> Vec<Waits> {
    let mut dependents: HashMap<&str, Vec<String>> = HashMap::new();
    let mut prior_dependents: HashMap<&str, Vec<String>> = HashMap::new();

    for change in &plan.changes {
        if change.action != ChangeAction::Delete
            && let Some(node) = &change.node
        {
            for dep in &node.depends_on {
                dependents.entry(dep.as_str()).or_default().push(change.id.clone());
            }
        }
        if let Some(record) = prior.get(&change.id).or(change.prior.as_ref()) {
            for dep in &record.depends_on {
                prior_dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(change.id.clone());
            }
        }
    }

    plan.changes
        .iter()
        .map(|change| Waits {
            dependencies: match (&change.node, change.action) {
                (Some(node), action) if action != ChangeAction::Delete => {
                    node.depends_on.iter().cloned().collect()
                }
                _ => Vec::new(),
            },
            dependents: dependents.remove(change.id.as_str()).unwrap_or_default(),
            prior_dependents: prior_dependents.remove(change.id.as_str()).unwrap_or_default(),
        })
        .collect()
}

fn with_id(mut outputs: Outputs, provider_id: &str) -> Outputs {
    outputs.insert(String::from("id"), serde_json::Value::String(provider_id.to_string()));
    outputs
}

/// One change being applied.
struct Task {
    shared: Arc<Shared>,
    change: PlannedChange,
    prior: Option<StateRecord>,
    waits: Waits,
    signal: watch::Sender<Progress>,
    outcome: NodeOutcome,
    started: Option<Instant>,
    /// Provider ids of the dependencies this change was resolved against.
    dependency_ids: BTreeMap<String, String>,
}

impl Task {
    async fn run(mut self) -> NodeOutcome {
        let result = if self.change.action == ChangeAction::Delete {
            self.delete().await
        } else {
            self.upsert().await
        };
        let elapsed = self.started.map(|s| s.elapsed()).unwrap_or_default();

        match result {
            Ok(outputs) => {
                debug!("{}: {} succeeded in {elapsed:?}", self.change.id, self.change.action);
                self.outcome.finish(NodeStatus::Succeeded, None, elapsed);
                self.signal.send_replace(Progress::Finished(Some(Arc::new(outputs))));
            }
            Err(Failure::Skipped(reason)) => {
                warn!("{reason}");
                self.outcome.finish(NodeStatus::Skipped, Some(reason.to_string()), elapsed);
                self.signal.send_replace(Progress::Finished(None));
            }
            Err(Failure::Failed(message)) => {
                error!("{} failed: {message}", self.change.description());
                self.outcome.finish(NodeStatus::Failed, Some(message), elapsed);
                self.signal.send_replace(Progress::Finished(None));
            }
        }
        self.outcome
    }

    /// Handles create, update, replace and no-op.
    async fn upsert(&mut self) -> Result<Outputs, Failure> {
        let mut inputs = BTreeMap::new();
        for dep in std::mem::take(&mut self.waits.dependencies) {
            let progress = self.wait_cancellable(&dep, Progress::is_settled).await?;
            let Some(outputs) = progress.outputs() else {
                return Err(Failure::Skipped(ApplyError::DependencyFailed {
                    id: self.change.id.clone(),
                    dependency: dep,
                }));
            };
            inputs.insert(dep, outputs);
        }
        self.dependency_ids = inputs
            .iter()
            .filter_map(|(dep, outputs)| {
                let id = outputs.get("id")?.as_str()?;
                Some((dep.clone(), id.to_string()))
            })
            .collect();

        self.check_cancelled()?;
        let Some(node) = self.change.node.clone() else {
            self.mark_started();
            return Err(Failure::Failed(format!("'{}' has no desired node", self.change.id)));
        };

        match (self.change.action, self.prior.clone()) {
            (ChangeAction::NoOp, Some(prior)) => {
                self.mark_started();
                Ok(with_id(prior.outputs.clone(), &prior.provider_id))
            }
            (ChangeAction::Update, Some(prior)) => {
                let properties = self.resolve_properties(&node, &inputs)?;
                self.update(&node, &prior, &properties).await
            }
            (ChangeAction::Replace, Some(prior)) => {
                let properties = self.resolve_properties(&node, &inputs)?;
                self.replace(&node, &prior, &properties).await
            }
            _ => {
                let properties = self.resolve_properties(&node, &inputs)?;
                self.create(&node, &properties).await
            }
        }
    }

    async fn delete(&mut self) -> Result<Outputs, Failure> {
        let shared = Arc::clone(&self.shared);
        for id in &shared.upserts {
            self.wait_cancellable(id, Progress::is_settled).await?;
        }
        for id in std::mem::take(&mut self.waits.prior_dependents) {
            let progress = self.wait_cancellable(&id, Progress::is_finished).await?;
            if progress.outputs().is_none() {
                return Err(Failure::Skipped(ApplyError::DependencyFailed {
                    id: self.change.id.clone(),
                    dependency: id,
                }));
            }
        }

        self.check_cancelled()?;
        if let Some(prior) = self.prior.clone() {
            self.delete_instance(&prior, true).await?;
        } else {
            self.mark_started();
        }
        self.remove_record().await?;
        Ok(Outputs::new())
    }

    async fn create(&mut self, node: &ResourceNode, properties: &Properties) -> Result<Outputs, Failure> {
        let provider = Arc::clone(&self.shared.provider);
        let created = self
            .call(format!("create {}", node.id), true, || {
                provider.create_resource(&node.resource_type, properties)
            })
            .await?;

        let record = StateRecord::new(
            &node.resource_type,
            &created.provider_id,
            node.placeholder_properties(),
            self.new_hash(node),
        )
        .with_outputs(created.outputs.clone())
        .with_depends_on(node.depends_on.clone())
        .with_dependency_ids(self.dependency_ids.clone());
        self.commit(record).await?;

        info!("Created {} '{}' ({})", node.resource_type, node.id, created.provider_id);
        Ok(with_id(created.outputs, &created.provider_id))
    }

    async fn update(
        &mut self,
        node: &ResourceNode,
        prior: &StateRecord,
        properties: &Properties,
    ) -> Result<Outputs, Failure> {
        let provider = Arc::clone(&self.shared.provider);
        let outputs = self
            .call(format!("update {}", node.id), true, || {
                provider.update_resource(&node.resource_type, &prior.provider_id, properties)
            })
            .await?;

        let record = prior
            .updated(
                node.placeholder_properties(),
                self.new_hash(node),
                outputs.clone(),
                node.depends_on.clone(),
            )
            .with_dependency_ids(self.dependency_ids.clone());
        self.commit(record).await?;

        info!("Updated {} '{}' ({})", node.resource_type, node.id, prior.provider_id);
        Ok(with_id(outputs, &prior.provider_id))
    }

    async fn replace(
        &mut self,
        node: &ResourceNode,
        prior: &StateRecord,
        properties: &Properties,
    ) -> Result<Outputs, Failure> {
        if self.change.replace_strategy == Some(ReplaceStrategy::CreateBeforeDelete) {
            let outputs = self.create(node, properties).await?;
            self.signal.send_replace(Progress::Available(Arc::new(outputs.clone())));

            let shared = Arc::clone(&self.shared);
            for id in &self.waits.dependents {
                shared.wait_for(id, Progress::is_finished).await;
            }
            for id in &self.waits.prior_dependents {
                shared.wait_for(id, Progress::is_settled).await;
            }

            if let Err(failure) = self.delete_instance(prior, false).await {
                warn!(
                    "Old instance {} of '{}' was left behind and must be removed by hand",
                    prior.provider_id, node.id
                );
                return Err(failure);
            }
            return Ok(outputs);
        }

        self.delete_instance(prior, true).await?;
        self.remove_record().await?;
        self.create(node, properties).await
    }

    async fn delete_instance(&mut self, prior: &StateRecord, interruptible: bool) -> Result<(), Failure> {
        let provider = Arc::clone(&self.shared.provider);
        self.call(
            format!("delete {} ({})", self.change.id, prior.provider_id),
            interruptible,
            || provider.delete_resource(&prior.resource_type, &prior.provider_id),
        )
        .await?;
        info!("Deleted {} '{}' ({})", prior.resource_type, self.change.id, prior.provider_id);
        Ok(())
    }

    /// Runs one provider operation under a permit, with retries.
    ///
    /// The node only becomes in progress once it holds a permit. An
    /// interruptible call gives up if the apply is cancelled while it queues.
    async fn call<T, F, Fut>(&mut self, what: String, interruptible: bool, op: F) -> Result<T, Failure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let shared = Arc::clone(&self.shared);
        let acquired = tokio::select! {
            biased;
            () = shared.cancel.cancelled(), if interruptible => return Err(self.interrupted(&what)),
            acquired = shared.permits.acquire() => acquired,
        };
        let permit = match acquired {
            Ok(permit) => permit,
            Err(e) => {
                self.mark_started();
                return Err(Failure::Failed(format!("executor shut down: {e}")));
            }
        };
        if interruptible && shared.cancel.is_cancelled() {
            return Err(self.interrupted(&what));
        }
        self.mark_started();
        debug!("Calling provider: {what}");
        let attempted = shared.retry.run(&what, op).await;
        drop(permit);

        self.outcome.attempts += attempted.attempts;
        attempted.result.map_err(|e| {
            if e.transient {
                Failure::Failed(
                    ApplyError::MaxAttemptsExceeded {
                        id: self.change.id.clone(),
                        attempts: attempted.attempts,
                        last_error: e.message,
                    }
                    .to_string(),
                )
            } else {
                Failure::Failed(e.message)
            }
        })
    }

    async fn commit(&self, record: StateRecord) -> Result<(), Failure> {
        self.shared
            .journal
            .commit(&self.change.id, record)
            .await
            .map_err(|e| self.shared.abort(&self.change.id, &e))
    }

    async fn remove_record(&self) -> Result<(), Failure> {
        self.shared
            .journal
            .remove(&self.change.id)
            .await
            .map_err(|e| self.shared.abort(&self.change.id, &e))
    }

    async fn wait_cancellable(&self, id: &str, ready: fn(&Progress) -> bool) -> Result<Progress, Failure> {
        tokio::select! {
            biased;
            progress = self.shared.wait_for(id, ready) => Ok(progress),
            () = self.shared.cancel.cancelled() => Err(Failure::Skipped(ApplyError::Cancelled {
                id: self.change.id.clone(),
            })),
        }
    }

    fn check_cancelled(&self) -> Result<(), Failure> {
        if self.shared.cancel.is_cancelled() {
            return Err(Failure::Skipped(ApplyError::Cancelled {
                id: self.change.id.clone(),
            }));
        }
        Ok(())
    }

    /// Failure for a call abandoned because of cancellation.
    ///
    /// A node that has not touched the provider yet is skipped. One that has
    /// (the delete half of a delete-before-create) fails and is picked up by
    /// the next plan.
    fn interrupted(&self, what: &str) -> Failure {
        if self.started.is_none() {
            Failure::Skipped(ApplyError::Cancelled {
                id: self.change.id.clone(),
            })
        } else {
            Failure::Failed(format!("apply cancelled before {what}"))
        }
    }

    fn mark_started(&mut self) {
        if self.started.is_some() {
            return;
        }
        self.outcome.transition(NodeStatus::InProgress);
        self.started = Some(Instant::now());
        if self.change.action != ChangeAction::NoOp {
            info!("{}", self.change.description());
        }
    }

    fn resolve_properties(
        &mut self,
        node: &ResourceNode,
        inputs: &BTreeMap<String, Arc<Outputs>>,
    ) -> Result<Properties, Failure> {
        let lookup = |reference: &Reference| {
            inputs
                .get(&reference.node)
                .and_then(|outputs| outputs.get(&reference.attribute).cloned())
        };
        let resolved: Result<Properties, Failure> = node
            .properties
            .iter()
            .map(|(name, value)| {
                resolve(value, &lookup)
                    .map(|resolved| (name.clone(), resolved))
                    .map_err(|reference| {
                        Failure::Failed(
                            ApplyError::UnresolvedOutput {
                                id: self.change.id.clone(),
                                reference: reference.to_string(),
                            }
                            .to_string(),
                        )
                    })
            })
            .collect();
        if resolved.is_err() {
            self.mark_started();
        }
        resolved
    }

    fn new_hash(&self, node: &ResourceNode) -> String {
        self.change.new_hash.clone().unwrap_or_else(|| {
            ConfigHasher::new().hash_properties(&node.resource_type, &node.placeholder_properties())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResourceSpec, TypeCapabilities};
    use crate::error::{Result, StateError};
    use crate::model::{CapabilityTable, GraphBuilder};
    use crate::planner;
    use crate::provider::{MemoryProvider, ProviderOp};
    use crate::state::{LocalStateStore, LockInfo};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        provider: Arc<MemoryProvider>,
        store: Arc<dyn StateStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(temp.path()));
            Self {
                _temp: temp,
                provider: Arc::new(MemoryProvider::new()),
                store,
            }
        }

        fn executor(&self) -> PlanExecutor {
            PlanExecutor::new(self.provider.clone(), Arc::clone(&self.store))
                .with_retry(fast_retry(3))
        }

        async fn apply(&self, specs: &[ResourceSpec], caps: &CapabilityTable) -> ApplyResult {
            self.apply_with(&self.executor(), specs, caps).await
        }

        async fn apply_with(
            &self,
            executor: &PlanExecutor,
            specs: &[ResourceSpec],
            caps: &CapabilityTable,
        ) -> ApplyResult {
            let prior = self.store.load().await.unwrap();
            let graph = GraphBuilder::new().build(specs).unwrap();
            let plan = planner::plan(&graph, &prior, caps).unwrap();
            executor.apply(&plan, &prior).await
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            call_timeout: Duration::from_secs(5),
        }
    }

    fn caps(strategy: ReplaceStrategy) -> CapabilityTable {
        CapabilityTable::default().with_type(
            "network",
            TypeCapabilities {
                immutable: BTreeSet::from([String::from("cidr")]),
                replace: Some(strategy),
            },
        )
    }

    fn network(cidr: &str) -> ResourceSpec {
        ResourceSpec::new("n1", "network").with_property("cidr", json!(cidr))
    }

    fn instance() -> ResourceSpec {
        ResourceSpec::new("i1", "instance")
            .with_property("network", Reference::new("n1", "id").to_value())
            .with_property("size", json!("small"))
    }

    fn position(calls: &[crate::provider::ProviderCall], op: ProviderOp, resource_type: &str) -> usize {
        calls
            .iter()
            .position(|c| c.op == op && c.resource_type == resource_type)
            .unwrap()
    }

    #[tokio::test]
    async fn test_creates_in_dependency_order_and_resolves_references() {
        let fx = Fixture::new();
        let result = fx
            .apply(&[instance(), network("10.0.0.0/16")], &caps(ReplaceStrategy::CreateBeforeDelete))
            .await;

        assert!(result.succeeded());
        let calls = fx.provider.calls().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].resource_type, "network");
        assert_eq!(
            calls[1].properties.as_ref().unwrap()["network"],
            json!("network-1")
        );

        let snapshot = fx.store.load().await.unwrap();
        assert_eq!(snapshot["n1"].provider_id, "network-1");
        assert_eq!(snapshot["i1"].depends_on, BTreeSet::from([String::from("n1")]));
        // References stay symbolic in state.
        assert_eq!(
            snapshot["i1"].last_applied_properties["network"],
            json!("${ref:n1.id}")
        );
        assert_eq!(result.deltas.len(), 2);
        assert_eq!(result.deltas[0].id(), "n1");
    }

    #[tokio::test]
    async fn test_second_apply_makes_no_calls() {
        let fx = Fixture::new();
        let specs = [network("10.0.0.0/16"), instance()];
        fx.apply(&specs, &caps(ReplaceStrategy::CreateBeforeDelete)).await;

        let result = fx.apply(&specs, &caps(ReplaceStrategy::CreateBeforeDelete)).await;
        assert!(result.succeeded());
        assert!(result.deltas.is_empty());
        assert_eq!(fx.provider.calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_but_not_independent_branches() {
        let fx = Fixture::new();
        fx.provider
            .fail(ProviderOp::Create, "network", ProviderError::permanent("quota exceeded"), None)
            .await;
        let bucket = ResourceSpec::new("logs", "bucket");

        let result = fx
            .apply(&[network("10.0.0.0/16"), instance(), bucket], &CapabilityTable::default())
            .await;

        let n1 = result.outcome("n1").unwrap();
        assert_eq!(n1.status, NodeStatus::Failed);
        assert_eq!(n1.error.as_deref(), Some("quota exceeded"));
        assert_eq!(n1.attempts, 1);

        let i1 = result.outcome("i1").unwrap();
        assert_eq!(i1.status, NodeStatus::Skipped);
        assert!(i1.error.as_deref().unwrap().contains("dependency 'n1'"));
        assert!(fx.provider.calls_for("instance").await.is_empty());

        assert_eq!(result.outcome("logs").unwrap().status, NodeStatus::Succeeded);
        assert!(!result.succeeded());
        assert_eq!(fx.store.load().await.unwrap().keys().collect::<Vec<_>>(), vec!["logs"]);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_until_exhausted() {
        let fx = Fixture::new();
        fx.provider
            .fail(ProviderOp::Create, "network", ProviderError::transient("throttled"), None)
            .await;

        let result = fx.apply(&[network("10.0.0.0/16")], &CapabilityTable::default()).await;

        let n1 = result.outcome("n1").unwrap();
        assert_eq!(n1.status, NodeStatus::Failed);
        assert_eq!(n1.attempts, 3);
        assert!(n1.error.as_deref().unwrap().contains("Maximum attempts (3)"));
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let fx = Fixture::new();
        fx.provider
            .fail(ProviderOp::Create, "network", ProviderError::transient("throttled"), Some(2))
            .await;

        let result = fx.apply(&[network("10.0.0.0/16")], &CapabilityTable::default()).await;

        let n1 = result.outcome("n1").unwrap();
        assert_eq!(n1.status, NodeStatus::Succeeded);
        assert_eq!(n1.attempts, 3);
    }

    #[tokio::test]
    async fn test_provider_calls_respect_concurrency_bound() {
        let temp = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(temp.path()));
        let provider = Arc::new(MemoryProvider::new().with_latency(Duration::from_millis(20)));
        let executor = PlanExecutor::new(provider.clone(), Arc::clone(&store))
            .with_retry(fast_retry(1))
            .with_concurrency(2);

        let specs: Vec<ResourceSpec> = (0..10)
            .map(|i| ResourceSpec::new(format!("q{i}"), "queue"))
            .collect();
        let graph = GraphBuilder::new().build(&specs).unwrap();
        let plan = planner::plan(&graph, &StateSnapshot::new(), &CapabilityTable::default()).unwrap();

        let result = executor.apply(&plan, &StateSnapshot::new()).await;

        assert!(result.succeeded());
        assert!(provider.max_in_flight() <= 2);
        assert!(provider.max_in_flight() >= 1);
        assert_eq!(store.load().await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_create_before_delete_replacement() {
        let fx = Fixture::new();
        let caps = caps(ReplaceStrategy::CreateBeforeDelete);
        fx.apply(&[network("10.0.0.0/16"), instance()], &caps).await;

        let result = fx.apply(&[network("10.1.0.0/16"), instance()], &caps).await;
        assert!(result.succeeded());

        let calls = fx.provider.calls().await;
        let create = position(&calls[2..], ProviderOp::Create, "network");
        let update = position(&calls[2..], ProviderOp::Update, "instance");
        let delete = position(&calls[2..], ProviderOp::Delete, "network");
        assert!(create < update && update < delete);
        assert_eq!(calls[2 + delete].provider_id.as_deref(), Some("network-1"));
        assert_eq!(
            calls[2 + update].properties.as_ref().unwrap()["network"],
            json!("network-2")
        );

        let snapshot = fx.store.load().await.unwrap();
        assert_eq!(snapshot["n1"].provider_id, "network-2");
        assert_eq!(snapshot["i1"].provider_id, "instance-1");
        assert!(!fx.provider.resources().await.contains_key("network-1"));
    }

    #[tokio::test]
    async fn test_delete_before_create_replacement() {
        let fx = Fixture::new();
        let caps = caps(ReplaceStrategy::DeleteBeforeCreate);
        fx.apply(&[network("10.0.0.0/16")], &caps).await;

        let result = fx.apply(&[network("10.1.0.0/16")], &caps).await;
        assert!(result.succeeded());

        let calls = fx.provider.calls_for("network").await;
        let ops: Vec<_> = calls.iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![ProviderOp::Create, ProviderOp::Delete, ProviderOp::Create]);

        let deltas: Vec<_> = result.deltas.iter().map(|d| matches!(d, crate::state::StateDelta::Removed { .. })).collect();
        assert_eq!(deltas, vec![true, false]);
        assert_eq!(fx.store.load().await.unwrap()["n1"].provider_id, "network-2");
    }

    #[tokio::test]
    async fn test_dependent_follows_dependency_recreated_after_failed_replacement() {
        let fx = Fixture::new();
        let caps = caps(ReplaceStrategy::DeleteBeforeCreate);
        fx.apply(&[network("10.0.0.0/16"), instance()], &caps).await;
        fx.provider
            .fail(ProviderOp::Create, "network", ProviderError::permanent("quota exceeded"), Some(1))
            .await;

        let specs = [network("10.1.0.0/16"), instance()];
        let interrupted = fx.apply(&specs, &caps).await;
        assert_eq!(interrupted.outcome("n1").unwrap().status, NodeStatus::Failed);
        assert_eq!(interrupted.outcome("i1").unwrap().status, NodeStatus::Skipped);

        let prior = fx.store.load().await.unwrap();
        assert!(!prior.contains_key("n1"));
        assert_eq!(prior["i1"].dependency_ids["n1"], "network-1");
        let graph = GraphBuilder::new().build(&specs).unwrap();
        let plan = planner::plan(&graph, &prior, &caps).unwrap();
        assert_eq!(
            plan.actions(),
            vec![("n1", ChangeAction::Create), ("i1", ChangeAction::Update)]
        );

        let recovered = fx.apply(&specs, &caps).await;
        assert!(recovered.succeeded());
        let snapshot = fx.store.load().await.unwrap();
        assert_eq!(snapshot["n1"].provider_id, "network-2");
        assert_eq!(snapshot["i1"].dependency_ids["n1"], "network-2");
        let resources = fx.provider.resources().await;
        assert_eq!(resources["instance-1"].1["network"], json!("network-2"));
    }

    #[tokio::test]
    async fn test_deletes_run_in_reverse_dependency_order() {
        let fx = Fixture::new();
        fx.apply(&[network("10.0.0.0/16"), instance()], &CapabilityTable::default())
            .await;

        let result = fx.apply(&[], &CapabilityTable::default()).await;
        assert!(result.succeeded());

        let calls = fx.provider.calls().await;
        assert!(position(&calls, ProviderOp::Delete, "instance") < position(&calls, ProviderOp::Delete, "network"));
        assert!(fx.store.load().await.unwrap().is_empty());
        assert!(fx.provider.resources().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_dependency() {
        let fx = Fixture::new();
        fx.apply(&[network("10.0.0.0/16"), instance()], &CapabilityTable::default())
            .await;
        fx.provider
            .fail(ProviderOp::Delete, "instance", ProviderError::permanent("in use"), None)
            .await;

        let result = fx.apply(&[], &CapabilityTable::default()).await;

        assert_eq!(result.outcome("i1").unwrap().status, NodeStatus::Failed);
        assert_eq!(result.outcome("n1").unwrap().status, NodeStatus::Skipped);
        assert_eq!(fx.store.load().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_output_fails_node() {
        let fx = Fixture::new();
        let reader = ResourceSpec::new("i1", "instance")
            .with_property("zone", Reference::new("n1", "availability_zone").to_value());

        let result = fx
            .apply(&[network("10.0.0.0/16"), reader], &CapabilityTable::default())
            .await;

        let i1 = result.outcome("i1").unwrap();
        assert_eq!(i1.status, NodeStatus::Failed);
        assert!(i1.error.as_deref().unwrap().contains("n1.availability_zone"));
        assert!(fx.provider.calls_for("instance").await.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips_everything() {
        let fx = Fixture::new();
        let executor = fx.executor();
        executor.cancel_handle().cancel();

        let result = fx
            .apply_with(&executor, &[network("10.0.0.0/16"), instance()], &CapabilityTable::default())
            .await;

        assert!(result.cancelled);
        assert_eq!(result.count(NodeStatus::Skipped), 2);
        assert!(fx.provider.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_lets_in_flight_calls_finish() {
        let temp = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(temp.path()));
        let provider = Arc::new(MemoryProvider::new().with_latency(Duration::from_millis(100)));
        let executor = PlanExecutor::new(provider.clone(), Arc::clone(&store)).with_retry(fast_retry(1));
        let cancel = executor.cancel_handle();

        let graph = GraphBuilder::new().build(&[network("10.0.0.0/16"), instance()]).unwrap();
        let plan = planner::plan(&graph, &StateSnapshot::new(), &CapabilityTable::default()).unwrap();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });
        let result = executor.apply(&plan, &StateSnapshot::new()).await;
        canceller.await.unwrap();

        assert!(result.cancelled);
        assert_eq!(result.outcome("n1").unwrap().status, NodeStatus::Succeeded);
        assert_eq!(result.outcome("i1").unwrap().status, NodeStatus::Skipped);
        assert!(store.load().await.unwrap().contains_key("n1"));
    }

    #[tokio::test]
    async fn test_cancel_skips_nodes_queued_for_a_permit() {
        let temp = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(temp.path()));
        let provider = Arc::new(MemoryProvider::new().with_latency(Duration::from_millis(50)));
        let executor = PlanExecutor::new(provider.clone(), Arc::clone(&store))
            .with_retry(fast_retry(1))
            .with_concurrency(1);
        let cancel = executor.cancel_handle();

        let specs: Vec<ResourceSpec> = (0..10)
            .map(|i| ResourceSpec::new(format!("q{i}"), "queue"))
            .collect();
        let graph = GraphBuilder::new().build(&specs).unwrap();
        let plan = planner::plan(&graph, &StateSnapshot::new(), &CapabilityTable::default()).unwrap();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });
        let result = executor.apply(&plan, &StateSnapshot::new()).await;
        canceller.await.unwrap();

        assert!(result.cancelled);
        assert_eq!(result.count(NodeStatus::Succeeded), 1);
        assert_eq!(result.count(NodeStatus::Skipped), 9);
        assert_eq!(result.count(NodeStatus::InProgress), 0);
        assert_eq!(provider.calls().await.len(), 1);
        assert_eq!(store.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_between_delete_and_create_fails_replacement() {
        let temp = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(temp.path()));
        let provider = Arc::new(MemoryProvider::new().with_latency(Duration::from_millis(50)));
        let caps = caps(ReplaceStrategy::DeleteBeforeCreate);
        let executor = PlanExecutor::new(provider.clone(), Arc::clone(&store))
            .with_retry(fast_retry(1))
            .with_concurrency(1);

        let graph = GraphBuilder::new().build(&[network("10.0.0.0/16")]).unwrap();
        let plan = planner::plan(&graph, &StateSnapshot::new(), &caps).unwrap();
        assert!(executor.apply(&plan, &StateSnapshot::new()).await.succeeded());
        let cancel = executor.cancel_handle();

        let prior = store.load().await.unwrap();
        let graph = GraphBuilder::new().build(&[network("10.1.0.0/16")]).unwrap();
        let plan = planner::plan(&graph, &prior, &caps).unwrap();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let result = executor.apply(&plan, &prior).await;
        canceller.await.unwrap();

        let n1 = result.outcome("n1").unwrap();
        assert_eq!(n1.status, NodeStatus::Failed);
        assert!(n1.error.as_deref().unwrap().contains("cancelled before create n1"));
        let ops: Vec<_> = provider.calls().await.iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![ProviderOp::Create, ProviderOp::Delete]);
        assert!(store.load().await.unwrap().is_empty());
    }

    struct BrokenStore;

    #[async_trait]
    impl StateStore for BrokenStore {
        async fn load(&self) -> Result<StateSnapshot> {
            Ok(StateSnapshot::new())
        }

        async fn commit(&self, _id: &str, _record: &StateRecord) -> Result<()> {
            Err(StateError::write("disk full").into())
        }

        async fn remove(&self, _id: &str) -> Result<()> {
            Err(StateError::write("disk full").into())
        }

        async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
            Ok(LockInfo::new(holder))
        }

        async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
            Err(LockInfo::lost_id(lock_id))
        }

        async fn release_lock(&self, _lock_id: &str) -> Result<()> {
            Ok(())
        }

        async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
            Ok(None)
        }

        async fn is_locked(&self) -> Result<bool> {
            Ok(false)
        }

        fn backend_type(&self) -> &'static str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_state_store_failure_aborts_apply() {
        let provider = Arc::new(MemoryProvider::new());
        let executor = PlanExecutor::new(provider.clone(), Arc::new(BrokenStore)).with_retry(fast_retry(1));

        let graph = GraphBuilder::new().build(&[network("10.0.0.0/16"), instance()]).unwrap();
        let plan = planner::plan(&graph, &StateSnapshot::new(), &CapabilityTable::default()).unwrap();
        let result = executor.apply(&plan, &StateSnapshot::new()).await;

        assert!(result.cancelled);
        assert!(result.fatal_error.as_deref().unwrap().contains("disk full"));
        assert_eq!(result.outcome("n1").unwrap().status, NodeStatus::Failed);
        assert_eq!(result.outcome("i1").unwrap().status, NodeStatus::Skipped);
        assert!(result.deltas.is_empty());
    }
}
