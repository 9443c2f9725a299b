//! Partitioned record store with optimistic concurrency.
//!
//! Every read hands back an opaque [`RecordToken`]; the matching token must
//! accompany the next write, and a stale token fails the write instead of
//! overwriting newer data. The store is the sole arbiter between the racing
//! poll and webhook update paths.

mod memory;

pub use memory::MemoryRecordStore;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Opaque concurrency token. Returned with every read, required for updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordToken(pub(crate) u64);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record already exists: {partition}/{key}")]
    AlreadyExists { partition: String, key: String },

    #[error("record not found: {partition}/{key}")]
    NotFound { partition: String, key: String },

    #[error("stale concurrency token for {partition}/{key}")]
    VersionConflict { partition: String, key: String },

    #[error("record store backend error: {0}")]
    Backend(String),

    #[error("record decode error: {0}")]
    Decode(String),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(
        &self,
        partition: &str,
        key: &str,
    ) -> Result<Option<(Value, RecordToken)>, StoreError>;

    /// Create-only write; fails with [`StoreError::AlreadyExists`] if the key
    /// is taken.
    async fn put(&self, partition: &str, key: &str, value: Value)
        -> Result<RecordToken, StoreError>;

    /// Token-guarded overwrite; fails with [`StoreError::VersionConflict`] if
    /// the record changed since the token was read.
    async fn update(
        &self,
        partition: &str,
        key: &str,
        value: Value,
        token: RecordToken,
    ) -> Result<RecordToken, StoreError>;
}

pub fn trainings_partition(user_id: &str) -> String {
    format!("trainings:{user_id}")
}

pub fn generations_partition(user_id: &str) -> String {
    format!("generations:{user_id}")
}

pub fn control_partition(user_id: &str) -> String {
    format!("control:{user_id}")
}

/// Global mapping of remote job ids to owners, the reverse lookup the webhook
/// path needs against an otherwise owner-partitioned store.
pub const REMOTE_INDEX_PARTITION: &str = "remote-index";

pub const TRAINING_SLOT_KEY: &str = "training-slot";
pub const LEDGER_KEY: &str = "ledger";

pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn RecordStore,
    partition: &str,
    key: &str,
) -> Result<Option<(T, RecordToken)>, StoreError> {
    match store.get(partition, key).await? {
        Some((value, token)) => {
            let record =
                serde_json::from_value(value).map_err(|err| StoreError::Decode(err.to_string()))?;
            Ok(Some((record, token)))
        }
        None => Ok(None),
    }
}

pub async fn put_typed<T: Serialize>(
    store: &dyn RecordStore,
    partition: &str,
    key: &str,
    record: &T,
) -> Result<RecordToken, StoreError> {
    let value = serde_json::to_value(record).map_err(|err| StoreError::Decode(err.to_string()))?;
    store.put(partition, key, value).await
}

pub async fn update_typed<T: Serialize>(
    store: &dyn RecordStore,
    partition: &str,
    key: &str,
    record: &T,
    token: RecordToken,
) -> Result<RecordToken, StoreError> {
    let value = serde_json::to_value(record).map_err(|err| StoreError::Decode(err.to_string()))?;
    store.update(partition, key, value, token).await
}
