//! Variable runtime store
//!
//! Effective values resolve in order: runtime map entry, persisted value
//! (hydrated into the runtime map on first access when the variable is
//! marked `persist`), then `default_value`. The runtime map is
//! authoritative for the current session; durable-storage write failures
//! are logged and ignored.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::path::PathBuf;
use tracing::warn;

use crate::error::EngineError;
use crate::types::Variable;

// ============================================================================
// DURABLE KEY-VALUE PORT
// ============================================================================

/// Durable key-value surface for `persist: true` variables.
///
/// Keys are `"{scope}:{name}"`, values are JSON-serialized. An absent key
/// means the variable falls back to its default.
#[async_trait]
pub trait KeyValue: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, EngineError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), EngineError>;
    async fn remove(&self, key: &str) -> Result<(), EngineError>;
}

/// In-memory key-value surface. Values survive the engine instance but not
/// the process; the default when no durable surface is attached.
#[derive(Default)]
pub struct MemoryKeyValue {
    entries: DashMap<String, String>,
}

impl MemoryKeyValue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValue for MemoryKeyValue {
    async fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), EngineError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), EngineError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Key-value surface backed by a single JSON file, the host-app analog of
/// browser-local storage.
pub struct FileKeyValue {
    path: PathBuf,
    // Serializes read-modify-write cycles on the file
    lock: Mutex<()>,
}

impl FileKeyValue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read_map(&self) -> Result<serde_json::Map<String, Value>, EngineError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.as_object().cloned())
                .ok_or_else(|| {
                    EngineError::Persistence(format!(
                        "corrupt key-value file: {}",
                        self.path.display()
                    ))
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(serde_json::Map::new()),
            Err(e) => Err(EngineError::Persistence(e.to_string())),
        }
    }

    fn write_map(&self, map: &serde_json::Map<String, Value>) -> Result<(), EngineError> {
        let text = serde_json::to_string(&Value::Object(map.clone()))
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        std::fs::write(&self.path, text).map_err(|e| EngineError::Persistence(e.to_string()))
    }
}

#[async_trait]
impl KeyValue for FileKeyValue {
    async fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        let _guard = self.lock.lock();
        let map = self.read_map()?;
        Ok(map.get(key).map(|v| v.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), EngineError> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        let parsed: Value = serde_json::from_str(value)
            .map_err(|e| EngineError::Persistence(format!("value is not JSON: {e}")))?;
        map.insert(key.to_string(), parsed);
        self.write_map(&map)
    }

    async fn remove(&self, key: &str) -> Result<(), EngineError> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        map.remove(key);
        self.write_map(&map)
    }
}

// ============================================================================
// RUNTIME STORE
// ============================================================================

/// Process-wide runtime value map for variables, keyed by `"{scope}:{name}"`.
pub struct VariableRuntime {
    values: DashMap<String, Value>,
    /// Keys whose durable entry has already been consulted.
    hydrated: DashMap<String, ()>,
    kv: std::sync::Arc<dyn KeyValue>,
}

impl VariableRuntime {
    pub fn new(kv: std::sync::Arc<dyn KeyValue>) -> Self {
        Self {
            values: DashMap::new(),
            hydrated: DashMap::new(),
            kv,
        }
    }

    /// Effective value: runtime entry, then persisted entry, then default.
    pub async fn get(&self, variable: &Variable) -> Value {
        let key = variable.storage_key();

        if let Some(value) = self.values.get(&key) {
            return value.clone();
        }

        if variable.persist && !self.hydrated.contains_key(&key) {
            self.hydrated.insert(key.clone(), ());
            match self.kv.get(&key).await {
                Ok(Some(raw)) => match serde_json::from_str::<Value>(&raw) {
                    Ok(value) => {
                        self.values.insert(key, value.clone());
                        return value;
                    }
                    Err(e) => warn!(key = %variable.storage_key(), error = %e,
                        "discarding unparseable persisted variable value"),
                },
                Ok(None) => {}
                Err(e) => warn!(key = %variable.storage_key(), error = %e,
                    "failed to read persisted variable value"),
            }
        }

        variable.default_value.clone()
    }

    /// Write the runtime value, and write through to durable storage when
    /// the variable persists. The in-memory value takes effect even if the
    /// durable write fails.
    pub async fn set(&self, variable: &Variable, value: Value) {
        let key = variable.storage_key();
        self.values.insert(key.clone(), value.clone());
        // A set supersedes whatever durable state existed
        self.hydrated.insert(key.clone(), ());

        if variable.persist {
            if let Err(e) = self.kv.set(&key, &value.to_string()).await {
                warn!(key = %key, error = %e, "failed to persist variable value");
            }
        }
    }

    /// Clear both the runtime entry and any persisted entry. Called when
    /// the variable definition is deleted.
    pub async fn remove(&self, variable: &Variable) {
        let key = variable.storage_key();
        self.values.remove(&key);
        self.hydrated.remove(&key);
        if let Err(e) = self.kv.remove(&key).await {
            warn!(key = %key, error = %e, "failed to clear persisted variable value");
        }
    }

    /// True when a runtime entry exists for the composite key.
    pub fn has_runtime_value(&self, variable: &Variable) -> bool {
        self.values.contains_key(&variable.storage_key())
    }
}
