//! Run orchestration.
//!
//! The engine ties the stack document, the state store, the planner and the
//! executor together into one run: acquire the state lock, load the snapshot,
//! plan, apply, release the lock. The lock is released on every path once it
//! has been taken, and refreshed while an apply runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, StackSpec, StateBackend, StateConfig};
use crate::error::{ConfigError, HalyardError, Result, StateError};
use crate::executor::{ApplyResult, CancelHandle, PlanExecutor};
use crate::model::{CapabilityTable, GraphBuilder, ResourceGraph};
use crate::planner::{self, Plan};
use crate::provider::{Provider, RetryPolicy, create_provider};
use crate::state::{
    LOCK_REFRESH_SECS, LocalStateStore, LockInfo, S3StateStore, STATE_DIR, StateSnapshot, StateStore,
};

/// What a run converges the infrastructure to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Goal {
    /// The resources declared in the stack.
    Converge,
    /// Nothing: every resource in state is deleted.
    Destroy,
}

/// A plan computed under the state lock, waiting to be applied or abandoned.
#[derive(Debug)]
pub struct PendingApply {
    /// The plan to apply.
    pub plan: Plan,
    prior: StateSnapshot,
    lock: LockInfo,
}

/// Provisioning engine for one stack.
pub struct Engine {
    stack: StackSpec,
    graph: ResourceGraph,
    capabilities: CapabilityTable,
    store: Arc<dyn StateStore>,
    provider: Arc<dyn Provider>,
    cancel: CancelHandle,
    lock_refresh: Duration,
}

impl Engine {
    /// Opens the stack with the store and provider it configures.
    ///
    /// A relative local state path is resolved against `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is invalid, the provider cannot be
    /// built, or the state backend is misconfigured.
    pub async fn open(stack: StackSpec, base_dir: &Path) -> Result<Self> {
        let store = create_store(&stack.state, base_dir).await?;
        let provider = create_provider(&stack.provider)?;
        Self::new(stack, store, provider)
    }

    /// Creates an engine over explicit components.
    ///
    /// # Errors
    ///
    /// Returns a graph error if the stack's resources do not form a valid graph.
    pub fn new(stack: StackSpec, store: Arc<dyn StateStore>, provider: Arc<dyn Provider>) -> Result<Self> {
        let graph = GraphBuilder::new().build_stack(&stack)?;
        let capabilities = CapabilityTable::new(stack.types.clone());
        debug!(
            "Engine ready: {} resource(s), {} typed, store {}, provider {}",
            graph.len(),
            capabilities.type_names().len(),
            store.backend_type(),
            provider.name()
        );
        Ok(Self {
            stack,
            graph,
            capabilities,
            store,
            provider,
            cancel: CancelHandle::new(),
            lock_refresh: Duration::from_secs(LOCK_REFRESH_SECS),
        })
    }

    /// Uses an externally owned cancellation handle.
    #[must_use]
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets how often a running apply extends its lock.
    #[must_use]
    pub const fn with_lock_refresh(mut self, every: Duration) -> Self {
        self.lock_refresh = every;
        self
    }

    /// Returns the stack document.
    #[must_use]
    pub const fn stack(&self) -> &StackSpec {
        &self.stack
    }

    /// Returns the desired resource graph.
    #[must_use]
    pub const fn graph(&self) -> &ResourceGraph {
        &self.graph
    }

    /// Returns the state store.
    #[must_use]
    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.store)
    }

    /// Plans against the current snapshot without taking the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be loaded or planning fails.
    pub async fn plan(&self, goal: Goal) -> Result<Plan> {
        let prior = self.store.load().await?;
        self.plan_from(goal, &prior)
    }

    fn plan_from(&self, goal: Goal, prior: &StateSnapshot) -> Result<Plan> {
        let plan = match goal {
            Goal::Converge => planner::plan(&self.graph, prior, &self.capabilities)?,
            Goal::Destroy => planner::plan(&ResourceGraph::empty(), prior, &self.capabilities)?,
        };
        debug!(
            "Plan {} has {} change(s)",
            ConfigHasher::new().short_hash(&plan.fingerprint),
            plan.changes.len()
        );
        Ok(plan)
    }

    /// Takes the lock, loads the snapshot and plans.
    ///
    /// The lock stays held until the returned plan is passed to
    /// [`Engine::execute`] or [`Engine::abandon`].
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held elsewhere, or if loading or
    /// planning fails. The lock is released before such errors are returned.
    pub async fn prepare(&self, holder: &str, goal: Goal) -> Result<PendingApply> {
        let lock = self.store.acquire_lock(holder).await?;
        info!("Acquired state lock {} as {}", lock.lock_id, lock.holder);

        let planned = match self.store.load().await {
            Ok(prior) => self.plan_from(goal, &prior).map(|plan| (plan, prior)),
            Err(e) => Err(e),
        };

        match planned {
            Ok((plan, prior)) => Ok(PendingApply { plan, prior, lock }),
            Err(e) => {
                self.release(&lock).await;
                Err(e)
            }
        }
    }

    /// Applies a prepared plan and releases its lock.
    ///
    /// The lock is refreshed while the apply runs. If it is lost to another
    /// run, the apply is cancelled. Per-resource failures are reported in the
    /// result, not as an error.
    pub async fn execute(&self, pending: PendingApply) -> ApplyResult {
        let executor = PlanExecutor::new(Arc::clone(&self.provider), Arc::clone(&self.store))
            .with_retry(RetryPolicy::from_config(&self.stack.execution))
            .with_concurrency(self.stack.execution.concurrency)
            .with_cancel_handle(self.cancel.clone());

        let apply = executor.apply(&pending.plan, &pending.prior);
        tokio::pin!(apply);
        let mut ticker = tokio::time::interval(self.lock_refresh);
        ticker.tick().await;

        let result = loop {
            tokio::select! {
                result = &mut apply => break result,
                _ = ticker.tick() => self.refresh(&pending.lock).await,
            }
        };
        self.release(&pending.lock).await;
        result
    }

    /// Releases the lock of a plan that will not be applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the store refuses to release the lock.
    pub async fn abandon(&self, pending: PendingApply) -> Result<()> {
        self.store.release_lock(&pending.lock.lock_id).await?;
        info!("Released state lock {} without applying", pending.lock.lock_id);
        Ok(())
    }

    /// Prepares and executes in one step.
    ///
    /// # Errors
    ///
    /// Returns an error if preparing fails.
    pub async fn run(&self, holder: &str, goal: Goal) -> Result<(Plan, ApplyResult)> {
        let pending = self.prepare(holder, goal).await?;
        let plan = pending.plan.clone();
        let result = self.execute(pending).await;
        Ok((plan, result))
    }

    async fn refresh(&self, lock: &LockInfo) {
        match self.store.refresh_lock(&lock.lock_id).await {
            Ok(refreshed) => debug!("State lock {} held until {}", lock.lock_id, refreshed.expires_at),
            Err(HalyardError::State(StateError::LockLost { .. })) => {
                if !self.cancel.is_cancelled() {
                    error!("State lock {} was taken over, cancelling apply", lock.lock_id);
                    self.cancel.cancel();
                }
            }
            Err(e) => warn!("Failed to refresh state lock {}: {e}", lock.lock_id),
        }
    }

    async fn release(&self, lock: &LockInfo) {
        match self.store.release_lock(&lock.lock_id).await {
            Ok(()) => info!("Released state lock {}", lock.lock_id),
            Err(e) => warn!("Failed to release state lock {}: {e}", lock.lock_id),
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("project", &self.stack.project.name)
            .field("resources", &self.graph.len())
            .field("store", &self.store.backend_type())
            .field("provider", &self.provider.name())
            .finish_non_exhaustive()
    }
}

/// Builds the state store the stack configures.
///
/// # Errors
///
/// Returns a configuration error if the S3 backend has no bucket.
pub async fn create_store(config: &StateConfig, base_dir: &Path) -> Result<Arc<dyn StateStore>> {
    match config.backend {
        StateBackend::Local => {
            let dir = config
                .path
                .as_ref()
                .map_or_else(|| base_dir.join(STATE_DIR), |p| base_dir.join(PathBuf::from(p)));
            debug!("Using local state in {}", dir.display());
            Ok(Arc::new(LocalStateStore::with_base_dir(dir)))
        }
        StateBackend::S3 => {
            let bucket = config.bucket.as_deref().ok_or_else(|| {
                HalyardError::Config(ConfigError::validation(
                    "S3 bucket is required for the s3 backend",
                    "state.bucket",
                ))
            })?;
            debug!("Using S3 state in bucket {bucket}");
            Ok(Arc::new(
                S3StateStore::new(bucket, config.prefix.as_deref(), config.region.as_deref()).await,
            ))
        }
    }
}
