//! S3-based state storage backend.
//!
//! Records live one object per resource under `<prefix>records/<id>.json`.
//! A single `PutObject` is atomic, so no temp objects are needed. The lock
//! object is written with `If-None-Match: *`, which makes acquisition a
//! compare-and-set on the bucket.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::ProvideErrorMetadata;
use tracing::{debug, info, warn};

use crate::error::{HalyardError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo};
use super::store::StateStore;
use super::types::{StateRecord, StateSnapshot};

/// Record key segment.
const RECORDS_KEY: &str = "records/";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending in `/`.
    prefix: String,
}

/// Normalises a key prefix to be empty or end in exactly one `/`.
fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| format!("{p}/"))
        .unwrap_or_default()
}

impl S3StateStore {
    /// Creates a new S3 state store from the ambient AWS configuration.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    fn records_prefix(&self) -> String {
        format!("{}{RECORDS_KEY}", self.prefix)
    }

    fn record_key(&self, id: &str) -> String {
        format!("{}{id}.json", self.records_prefix())
    }

    fn lock_key(&self) -> String {
        format!("{}{LOCK_KEY}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    HalyardError::State(StateError::s3(format!("Failed to read S3 object: {e}")))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    HalyardError::State(StateError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object {key}: {e}"),
                    })
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(HalyardError::State(StateError::s3(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: String) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.into_bytes().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| HalyardError::State(StateError::write(format!("S3 put error: {e}"))))?;

        Ok(())
    }

    /// Puts an object only if the key does not exist yet.
    ///
    /// Returns `false` when the precondition failed.
    async fn put_object_if_absent(&self, key: &str, content: String) -> Result<bool> {
        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .if_none_match("*")
            .body(content.into_bytes().into())
            .content_type("application/json")
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                match service_err.code() {
                    Some("PreconditionFailed" | "ConditionalRequestConflict") => Ok(false),
                    _ => Err(HalyardError::State(StateError::LockFailed {
                        message: format!("S3 conditional put error: {service_err}"),
                    })),
                }
            }
        }
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| HalyardError::State(StateError::s3(format!("S3 delete error: {e}"))))?;

        Ok(())
    }

    /// Lists every key under the records prefix.
    async fn list_record_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(self.records_prefix())
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| HalyardError::State(StateError::s3(format!("S3 list error: {e}"))))?;

            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key())
                    .map(str::to_string),
            );

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        let records_prefix = self.records_prefix();
        debug!("Loading state from s3://{}/{records_prefix}", self.bucket);

        let mut snapshot = StateSnapshot::new();
        for key in self.list_record_keys().await? {
            let Some(id) = key
                .strip_prefix(&records_prefix)
                .and_then(|name| name.strip_suffix(".json"))
                .filter(|id| !id.contains('/'))
            else {
                debug!("Ignoring non-record object: {key}");
                continue;
            };

            let Some(content) = self.get_object(&key).await? else {
                continue;
            };
            let record: StateRecord = serde_json::from_str(&content).map_err(|e| {
                HalyardError::State(StateError::Corrupted {
                    message: format!("Failed to parse record {id}: {e}"),
                })
            })?;
            snapshot.insert(id.to_string(), record);
        }

        info!("Loaded {} records from S3", snapshot.len());
        Ok(snapshot)
    }

    async fn commit(&self, id: &str, record: &StateRecord) -> Result<()> {
        let key = self.record_key(id);
        let content = serde_json::to_string_pretty(record).map_err(|e| {
            HalyardError::State(StateError::serialization(format!(
                "Failed to serialize record {id}: {e}"
            )))
        })?;

        self.put_object(&key, content).await?;
        debug!("Committed record {id} to s3://{}/{key}", self.bucket);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let key = self.record_key(id);
        self.delete_object(&key).await?;
        debug!("Removed record {id} from s3://{}/{key}", self.bucket);
        Ok(())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let key = self.lock_key();
        let lock_info = LockInfo::new(holder);

        if self.put_object_if_absent(&key, lock_info.to_json()?).await? {
            info!(
                "Acquired state lock: {} (expires in {}s)",
                lock_info.lock_id, LOCK_EXPIRY_SECS
            );
            return Ok(lock_info);
        }

        if let Some(existing) = self.get_lock_info().await? {
            if !existing.is_expired() {
                return Err(existing.conflict());
            }
            warn!("Taking over expired lock held by {}", existing.holder);
            self.delete_object(&key).await?;
        }

        if self.put_object_if_absent(&key, lock_info.to_json()?).await? {
            info!("Acquired state lock: {}", lock_info.lock_id);
            return Ok(lock_info);
        }

        match self.get_lock_info().await? {
            Some(existing) => Err(existing.conflict()),
            None => Err(HalyardError::State(StateError::LockFailed {
                message: String::from("Lock object changed while acquiring"),
            })),
        }
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        match self.get_lock_info().await? {
            Some(mut existing) if existing.lock_id == lock_id => {
                existing.refresh();
                self.put_object(&self.lock_key(), existing.to_json()?).await?;
                debug!("Refreshed state lock {lock_id} until {}", existing.expires_at);
                Ok(existing)
            }
            _ => Err(LockInfo::lost_id(lock_id)),
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.get_lock_info().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.lock_key()).await?;
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
        match self.get_object(&self.lock_key()).await? {
            Some(content) => LockInfo::from_json(&content).map(Some),
            None => Ok(None),
        }
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
