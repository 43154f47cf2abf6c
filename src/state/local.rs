//! Local file-based state storage backend.
//!
//! Layout under the base directory:
//!
//! ```text
//! .halyard/
//!   records/<id>.json   one record per resource
//!   state.lock          present while a run holds the lock
//! ```
//!
//! Every record write goes through `<id>.json.tmp`, is flushed to disk,
//! renamed over the final name, and the directory is synced, so a crash
//! leaves either the old or the new record and never a torn one.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{HalyardError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo};
use super::store::StateStore;
use super::types::{StateRecord, StateSnapshot};

/// Default state directory name.
pub const STATE_DIR: &str = ".halyard";

/// Record directory name.
const RECORDS_DIR: &str = "records";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Directory holding one file per record.
    records_dir: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a store under `.halyard` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| HalyardError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            records_dir: base_dir.join(RECORDS_DIR),
            lock_path: base_dir.join(LOCK_FILE),
        }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.records_dir.join(format!("{id}.json"))
    }

    async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.records_dir).await.map_err(|e| {
            HalyardError::State(StateError::write(format!(
                "Failed to create state directory {}: {e}",
                self.records_dir.display()
            )))
        })
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        match fs::read_to_string(&self.lock_path).await {
            Ok(content) => LockInfo::from_json(&content).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HalyardError::State(StateError::Corrupted {
                message: format!("Failed to read lock file: {e}"),
            })),
        }
    }

    /// Creates the lock file, failing if it already exists.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> Result<bool> {
        let content = lock_info.to_json()?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(HalyardError::State(StateError::LockFailed {
                    message: format!("Failed to create lock file: {e}"),
                }));
            }
        };

        file.write_all(content.as_bytes()).await.map_err(|e| {
            HalyardError::State(StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })
        })?;
        file.sync_all().await.map_err(|e| {
            HalyardError::State(StateError::LockFailed {
                message: format!("Failed to sync lock file: {e}"),
            })
        })?;

        Ok(true)
    }

    /// Replaces the lock file through a temp file and a rename.
    async fn rewrite_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        let content = lock_info.to_json()?;
        let temp_path = self.lock_path.with_extension("lock.tmp");
        let lock_failed = |e: std::io::Error| {
            HalyardError::State(StateError::LockFailed {
                message: format!("Failed to rewrite lock file: {e}"),
            })
        };

        let mut file = fs::File::create(&temp_path).await.map_err(lock_failed)?;
        file.write_all(content.as_bytes()).await.map_err(lock_failed)?;
        file.sync_all().await.map_err(lock_failed)?;
        drop(file);
        fs::rename(&temp_path, &self.lock_path).await.map_err(lock_failed)
    }

    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HalyardError::State(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })),
        }
    }
}

/// Flushes directory entries so a completed rename survives a crash.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<()> {
    let handle = fs::File::open(dir).await.map_err(|e| {
        HalyardError::State(StateError::write(format!("Failed to open state directory: {e}")))
    })?;
    handle.sync_all().await.map_err(|e| {
        HalyardError::State(StateError::write(format!("Failed to sync state directory: {e}")))
    })
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        let mut snapshot = StateSnapshot::new();

        let mut entries = match fs::read_dir(&self.records_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("State directory does not exist: {}", self.records_dir.display());
                return Ok(snapshot);
            }
            Err(e) => {
                return Err(HalyardError::State(StateError::Corrupted {
                    message: format!("Failed to list state directory: {e}"),
                }));
            }
        };

        info!("Loading state from: {}", self.records_dir.display());

        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            HalyardError::State(StateError::Corrupted {
                message: format!("Failed to list state directory: {e}"),
            })
        })? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                debug!("Ignoring non-record file: {}", path.display());
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };

            let content = fs::read_to_string(&path).await.map_err(|e| {
                HalyardError::State(StateError::Corrupted {
                    message: format!("Failed to read record {id}: {e}"),
                })
            })?;
            let record: StateRecord = serde_json::from_str(&content).map_err(|e| {
                HalyardError::State(StateError::Corrupted {
                    message: format!("Failed to parse record {id}: {e}"),
                })
            })?;

            snapshot.insert(id, record);
        }

        debug!("Loaded {} records", snapshot.len());
        Ok(snapshot)
    }

    async fn commit(&self, id: &str, record: &StateRecord) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(record).map_err(|e| {
            HalyardError::State(StateError::serialization(format!(
                "Failed to serialize record {id}: {e}"
            )))
        })?;

        let final_path = self.record_path(id);
        let temp_path = self.records_dir.join(format!("{id}.json.tmp"));

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            HalyardError::State(StateError::write(format!("Failed to create {}: {e}", temp_path.display())))
        })?;
        file.write_all(content.as_bytes()).await.map_err(|e| {
            HalyardError::State(StateError::write(format!("Failed to write record {id}: {e}")))
        })?;
        file.sync_all().await.map_err(|e| {
            HalyardError::State(StateError::write(format!("Failed to sync record {id}: {e}")))
        })?;
        drop(file);

        fs::rename(&temp_path, &final_path).await.map_err(|e| {
            HalyardError::State(StateError::write(format!("Failed to rename record {id}: {e}")))
        })?;
        sync_dir(&self.records_dir).await?;

        debug!("Committed record {id}");
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        match fs::remove_file(self.record_path(id)).await {
            Ok(()) => {
                sync_dir(&self.records_dir).await?;
                debug!("Removed record {id}");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HalyardError::State(StateError::write(format!(
                "Failed to remove record {id}: {e}"
            )))),
        }
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        self.ensure_dir().await?;
        let lock_info = LockInfo::new(holder);

        if self.create_lock_file(&lock_info).await? {
            info!(
                "Acquired state lock: {} (expires in {}s)",
                lock_info.lock_id, LOCK_EXPIRY_SECS
            );
            return Ok(lock_info);
        }

        match self.read_lock_file().await? {
            Some(existing) if !existing.is_expired() => return Err(existing.conflict()),
            Some(existing) => {
                warn!("Taking over expired lock held by {}", existing.holder);
                self.delete_lock_file().await?;
            }
            None => {}
        }

        if self.create_lock_file(&lock_info).await? {
            info!("Acquired state lock: {}", lock_info.lock_id);
            return Ok(lock_info);
        }

        // Another process won the race for the expired lock.
        match self.read_lock_file().await? {
            Some(existing) => Err(existing.conflict()),
            None => Err(HalyardError::State(StateError::LockFailed {
                message: String::from("Lock file changed while acquiring"),
            })),
        }
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        match self.read_lock_file().await? {
            Some(mut existing) if existing.lock_id == lock_id => {
                existing.refresh();
                self.rewrite_lock_file(&existing).await?;
                debug!("Refreshed state lock {lock_id} until {}", existing.expires_at);
                Ok(existing)
            }
            _ => Err(LockInfo::lost_id(lock_id)),
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                warn!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .read_lock_file()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
