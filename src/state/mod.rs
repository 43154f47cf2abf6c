//! State management module.
//!
//! Persistent per-resource records of what was last applied, behind a
//! [`StateStore`] trait with local-directory and S3 backends, plus the
//! journal the executor commits through.

mod journal;
mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use journal::StateJournal;
pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LOCK_REFRESH_SECS, LockInfo, generate_holder_id};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{STATE_VERSION, StateDelta, StateRecord, StateSnapshot};
