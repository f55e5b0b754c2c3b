//! Storage collaborator port
//!
//! The engine persists entity records through an abstract async CRUD
//! interface over named collections and never assumes a storage
//! technology. Records cross the boundary as JSON values carrying `id`
//! and `project_id` fields.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::EngineError;

/// Collection names used by the engine.
pub mod collections {
    pub const DATA_TABLES: &str = "dataTables";
    pub const API_ENDPOINTS: &str = "apiEndpoints";
    pub const VARIABLES: &str = "variables";
    pub const TRANSFORMERS: &str = "transformers";
}

/// Abstract async CRUD over named collections.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a full record. The record carries its own id.
    async fn insert(&self, collection: &str, record: Value) -> Result<(), EngineError>;

    /// Shallow-merge `partial` into the stored record.
    async fn update(&self, collection: &str, id: &str, partial: Value) -> Result<(), EngineError>;

    /// Delete by id. Idempotent: deleting an absent id succeeds.
    async fn delete(&self, collection: &str, id: &str) -> Result<(), EngineError>;

    async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>, EngineError>;

    /// List records, optionally filtered by `project_id`.
    async fn list(
        &self,
        collection: &str,
        project_id: Option<&str>,
    ) -> Result<Vec<Value>, EngineError>;
}

/// In-memory storage, the default collaborator and the one tests use.
#[derive(Default)]
pub struct MemoryStorage {
    collections: DashMap<String, DashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn collection(&self, name: &str) -> dashmap::mapref::one::Ref<'_, String, DashMap<String, Value>> {
        self.collections
            .entry(name.to_string())
            .or_default()
            .downgrade()
    }

    fn record_id(record: &Value) -> Result<String, EngineError> {
        record
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EngineError::Persistence("record has no string id".to_string()))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn insert(&self, collection: &str, record: Value) -> Result<(), EngineError> {
        let id = Self::record_id(&record)?;
        self.collection(collection).insert(id, record);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, partial: Value) -> Result<(), EngineError> {
        let coll = self.collection(collection);
        let mut existing = coll.get_mut(id).ok_or_else(|| {
            EngineError::Persistence(format!("no record '{id}' in '{collection}'"))
        })?;
        if let (Some(target), Some(fields)) = (existing.as_object_mut(), partial.as_object()) {
            for (key, value) in fields {
                target.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), EngineError> {
        self.collection(collection).remove(id);
        Ok(())
    }

    async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>, EngineError> {
        Ok(self.collection(collection).get(id).map(|r| r.clone()))
    }

    async fn list(
        &self,
        collection: &str,
        project_id: Option<&str>,
    ) -> Result<Vec<Value>, EngineError> {
        let coll = self.collection(collection);
        Ok(coll
            .iter()
            .filter(|entry| match project_id {
                Some(pid) => entry.value().get("project_id").and_then(Value::as_str) == Some(pid),
                None => true,
            })
            .map(|entry| entry.value().clone())
            .collect())
    }
}

/// Storage double that fails a configurable number of upcoming mutations.
/// Used in tests to verify rollback behavior.
#[derive(Default)]
pub struct FailingStorage {
    inner: MemoryStorage,
    failures_left: AtomicUsize,
}

impl FailingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the next `n` mutating calls to fail.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Storage for FailingStorage {
    async fn insert(&self, collection: &str, record: Value) -> Result<(), EngineError> {
        if self.take_failure() {
            return Err(EngineError::Persistence("storage write refused".to_string()));
        }
        self.inner.insert(collection, record).await
    }

    async fn update(&self, collection: &str, id: &str, partial: Value) -> Result<(), EngineError> {
        if self.take_failure() {
            return Err(EngineError::Persistence("storage write refused".to_string()));
        }
        self.inner.update(collection, id, partial).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), EngineError> {
        if self.take_failure() {
            return Err(EngineError::Persistence("storage delete refused".to_string()));
        }
        self.inner.delete(collection, id).await
    }

    async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>, EngineError> {
        self.inner.get_by_id(collection, id).await
    }

    async fn list(
        &self,
        collection: &str,
        project_id: Option<&str>,
    ) -> Result<Vec<Value>, EngineError> {
        self.inner.list(collection, project_id).await
    }
}
