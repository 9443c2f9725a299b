use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{RecordStore, RecordToken, StoreError};

struct Versioned {
    version: u64,
    value: Value,
}

/// Process-local record store. Versions are per-record monotonic counters;
/// a write carrying anything but the latest counter is rejected.
#[derive(Default)]
pub struct MemoryRecordStore {
    inner: RwLock<HashMap<(String, String), Versioned>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test-only enumeration of a partition's keys; the production port has
    /// no listing operation.
    #[cfg(test)]
    pub async fn keys_in(&self, partition: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .keys()
            .filter(|(candidate, _)| candidate == partition)
            .map(|(_, key)| key.clone())
            .collect()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(
        &self,
        partition: &str,
        key: &str,
    ) -> Result<Option<(Value, RecordToken)>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .get(&(partition.to_string(), key.to_string()))
            .map(|record| (record.value.clone(), RecordToken(record.version))))
    }

    async fn put(
        &self,
        partition: &str,
        key: &str,
        value: Value,
    ) -> Result<RecordToken, StoreError> {
        let mut inner = self.inner.write().await;
        let slot = (partition.to_string(), key.to_string());
        if inner.contains_key(&slot) {
            return Err(StoreError::AlreadyExists {
                partition: partition.to_string(),
                key: key.to_string(),
            });
        }
        inner.insert(slot, Versioned { version: 1, value });
        Ok(RecordToken(1))
    }

    async fn update(
        &self,
        partition: &str,
        key: &str,
        value: Value,
        token: RecordToken,
    ) -> Result<RecordToken, StoreError> {
        let mut inner = self.inner.write().await;
        let slot = (partition.to_string(), key.to_string());
        let Some(record) = inner.get_mut(&slot) else {
            return Err(StoreError::NotFound {
                partition: partition.to_string(),
                key: key.to_string(),
            });
        };
        if record.version != token.0 {
            return Err(StoreError::VersionConflict {
                partition: partition.to_string(),
                key: key.to_string(),
            });
        }
        record.version += 1;
        record.value = value;
        Ok(RecordToken(record.version))
    }
}
