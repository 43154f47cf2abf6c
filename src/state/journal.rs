//! Commit journal used by the executor.
//!
//! Wraps a [`StateStore`] so that writes for the same id are serialised while
//! writes for different ids may run concurrently, and keeps the ordered list of
//! deltas that actually reached the store.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

use super::store::StateStore;
use super::types::{StateDelta, StateRecord};

/// Serialising writer in front of a state store.
pub struct StateJournal {
    store: Arc<dyn StateStore>,
    id_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    deltas: Mutex<Vec<StateDelta>>,
}

impl StateJournal {
    /// Creates a journal writing to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            id_locks: Mutex::new(HashMap::new()),
            deltas: Mutex::new(Vec::new()),
        }
    }

    async fn id_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.id_locks.lock().await;
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    /// Durably writes the record for `id`.
    ///
    /// # Errors
    ///
    /// Returns the store's error; the delta is not recorded in that case.
    pub async fn commit(&self, id: &str, record: StateRecord) -> Result<()> {
        let lock = self.id_lock(id).await;
        let _guard = lock.lock().await;

        self.store.commit(id, &record).await?;
        debug!("Journal committed {id}");
        self.deltas.lock().await.push(StateDelta::Committed {
            id: id.to_string(),
            record,
        });
        Ok(())
    }

    /// Durably removes the record for `id`.
    ///
    /// # Errors
    ///
    /// Returns the store's error; the delta is not recorded in that case.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let lock = self.id_lock(id).await;
        let _guard = lock.lock().await;

        self.store.remove(id).await?;
        debug!("Journal removed {id}");
        self.deltas
            .lock()
            .await
            .push(StateDelta::Removed { id: id.to_string() });
        Ok(())
    }

    /// Returns the deltas committed so far, in commit order.
    pub async fn deltas(&self) -> Vec<StateDelta> {
        self.deltas.lock().await.clone()
    }
}

impl std::fmt::Debug for StateJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateJournal")
            .field("backend", &self.store.backend_type())
            .finish_non_exhaustive()
    }
}
