//! Persistent key-value substrate.
//!
//! The limiter persists a handful of small records (tier snapshot, server health and
//! notification markers). The store is treated as eventually consistent: a missing key
//! means "unset", and failures are logged by callers rather than propagated.

use crate::error::StorageError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// A partial record of key → JSON value.
pub type Record = HashMap<String, Value>;

/// Async get/set/remove over string keys.
#[async_trait]
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    /// Fetch the given keys. Keys that are not present are omitted from the result.
    async fn get(&self, keys: &[&str]) -> Result<Record, StorageError>;

    /// Write every entry of `record`, replacing existing values.
    async fn set(&self, record: Record) -> Result<(), StorageError>;

    /// Delete the given keys; missing keys are ignored.
    async fn remove(&self, keys: &[&str]) -> Result<(), StorageError>;
}

/// Process-local store, shared between clones.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    data: Arc<Mutex<Record>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, e.g. to simulate state left behind by a previous process.
    pub fn with_record(record: Record) -> Self {
        Self { data: Arc::new(Mutex::new(record)) }
    }

    /// Copy of everything currently stored.
    pub fn dump(&self) -> Record {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, keys: &[&str]) -> Result<Record, StorageError> {
        let guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(keys
            .iter()
            .filter_map(|k| guard.get(*k).map(|v| ((*k).to_string(), v.clone())))
            .collect())
    }

    async fn set(&self, record: Record) -> Result<(), StorageError> {
        let mut guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        guard.extend(record);
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), StorageError> {
        let mut guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            guard.remove(*key);
        }
        Ok(())
    }
}
