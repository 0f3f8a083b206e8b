//! Partitioned key-value tables backing persistent trust stores.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum StorageError {
    #[error("key `{0}` already exists")]
    KeyExists(String),
    #[error("key `{0}` not found")]
    KeyNotFound(String),
    #[error("storage backend error: `{0}`")]
    Backend(String),
}

/// One table of an application's storage engine.
///
/// Rows are addressed by `(partition_id, key)`.
#[async_trait]
pub trait StorageTable: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, partition_id: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Inserts a row. Without a `key`, a unique one is generated. Returns the key used.
    async fn insert(
        &self,
        partition_id: &str,
        key: Option<&str>,
        data: Vec<u8>,
    ) -> Result<String, StorageError>;

    /// Replaces an existing row.
    async fn update(&self, partition_id: &str, key: &str, data: Vec<u8>) -> Result<(), StorageError>;

    /// Returns whether a row was removed.
    async fn delete(&self, partition_id: &str, key: &str) -> Result<bool, StorageError>;

    /// All rows of a partition as `(key, data)`.
    async fn enumerate(&self, partition_id: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;
}

type Partitions = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// A local in-memory table. Not for production use!
///
/// # Warning
/// Contents are lost when the process exits.
#[derive(Debug, Clone)]
pub struct MemoryStorageTable {
    name: String,
    storage: Arc<Mutex<Partitions>>,
}

impl MemoryStorageTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: Arc::default(),
        }
    }
}

#[async_trait]
impl StorageTable for MemoryStorageTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, partition_id: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let storage = self.storage.lock().await;
        Ok(storage
            .get(partition_id)
            .and_then(|partition| partition.get(key))
            .cloned())
    }

    async fn insert(
        &self,
        partition_id: &str,
        key: Option<&str>,
        data: Vec<u8>,
    ) -> Result<String, StorageError> {
        let mut storage = self.storage.lock().await;
        let partition = storage.entry(partition_id.to_string()).or_default();

        let key = match key {
            Some(key) if partition.contains_key(key) => {
                return Err(StorageError::KeyExists(key.to_string()))
            }
            Some(key) => key.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        partition.insert(key.clone(), data);
        Ok(key)
    }

    async fn update(&self, partition_id: &str, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        let mut storage = self.storage.lock().await;
        match storage
            .get_mut(partition_id)
            .and_then(|partition| partition.get_mut(key))
        {
            Some(row) => {
                *row = data;
                Ok(())
            }
            None => Err(StorageError::KeyNotFound(key.to_string())),
        }
    }

    async fn delete(&self, partition_id: &str, key: &str) -> Result<bool, StorageError> {
        let mut storage = self.storage.lock().await;
        Ok(storage
            .get_mut(partition_id)
            .and_then(|partition| partition.remove(key))
            .is_some())
    }

    async fn enumerate(&self, partition_id: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let storage = self.storage.lock().await;
        Ok(storage
            .get(partition_id)
            .map(|partition| {
                partition
                    .iter()
                    .map(|(key, data)| (key.clone(), data.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
