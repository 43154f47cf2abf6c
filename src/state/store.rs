//! State store trait definition.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::{StateRecord, StateSnapshot};
use crate::error::Result;

/// Trait for state storage backends.
///
/// Records are stored per resource id, so a commit for one id never rewrites
/// another. Implementations must make `commit` and `remove` durable before
/// returning.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads every record. Returns an empty snapshot if no state exists yet.
    async fn load(&self) -> Result<StateSnapshot>;

    /// Atomically writes the record for `id`, replacing any previous one.
    async fn commit(&self, id: &str, record: &StateRecord) -> Result<()>;

    /// Removes the record for `id`. Removing a missing record succeeds.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Acquires the state lock.
    ///
    /// An empty `holder` is replaced by a generated holder id.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Extends the expiry of the lock `lock_id` and returns it.
    ///
    /// Fails with [`StateError::LockLost`](crate::error::StateError::LockLost)
    /// if the lock is gone or now belongs to another run.
    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` still owns it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if a lock file exists.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if an unexpired lock is held.
    async fn is_locked(&self) -> Result<bool>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}
