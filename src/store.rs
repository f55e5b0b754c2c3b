//! Entity store
//!
//! In-memory maps of the four entity kinds, kept consistent with the
//! storage collaborator by persisting first and committing to memory only
//! after the write succeeds. A failed storage call leaves memory exactly
//! as it was. Every committed mutation publishes a change event.

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::broadcast::{Broadcast, ChangeEvent, ChangeKind};
use crate::error::EngineError;
use crate::storage::{collections, Storage};
use crate::types::{
    ApiEndpoint, ApiEndpointUpdate, DataTable, DataTableUpdate, EntityId, Field, Transformer,
    TransformerUpdate, Variable, VariableScope, VariableUpdate,
};

/// A storable entity kind.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: &'static str;
    const KIND: &'static str;
    const CHANGE: ChangeKind;

    fn id(&self) -> &str;
    fn project_id(&self) -> &str;
}

impl Record for DataTable {
    const COLLECTION: &'static str = collections::DATA_TABLES;
    const KIND: &'static str = "DataTable";
    const CHANGE: ChangeKind = ChangeKind::DataTable;

    fn id(&self) -> &str {
        &self.id
    }
    fn project_id(&self) -> &str {
        &self.project_id
    }
}

impl Record for ApiEndpoint {
    const COLLECTION: &'static str = collections::API_ENDPOINTS;
    const KIND: &'static str = "ApiEndpoint";
    const CHANGE: ChangeKind = ChangeKind::ApiEndpoint;

    fn id(&self) -> &str {
        &self.id
    }
    fn project_id(&self) -> &str {
        &self.project_id
    }
}

impl Record for Variable {
    const COLLECTION: &'static str = collections::VARIABLES;
    const KIND: &'static str = "Variable";
    const CHANGE: ChangeKind = ChangeKind::Variable;

    fn id(&self) -> &str {
        &self.id
    }
    fn project_id(&self) -> &str {
        &self.project_id
    }
}

impl Record for Transformer {
    const COLLECTION: &'static str = collections::TRANSFORMERS;
    const KIND: &'static str = "Transformer";
    const CHANGE: ChangeKind = ChangeKind::Transformer;

    fn id(&self) -> &str {
        &self.id
    }
    fn project_id(&self) -> &str {
        &self.project_id
    }
}

/// Concurrent maps of entity definitions plus the persistence discipline
/// around them.
pub struct EntityStore {
    storage: Arc<dyn Storage>,
    broadcast: Arc<dyn Broadcast>,
    tables: DashMap<EntityId, DataTable>,
    endpoints: DashMap<EntityId, ApiEndpoint>,
    variables: DashMap<EntityId, Variable>,
    transformers: DashMap<EntityId, Transformer>,
}

impl EntityStore {
    pub fn new(storage: Arc<dyn Storage>, broadcast: Arc<dyn Broadcast>) -> Self {
        Self {
            storage,
            broadcast,
            tables: DashMap::new(),
            endpoints: DashMap::new(),
            variables: DashMap::new(),
            transformers: DashMap::new(),
        }
    }

    /// Hydrate the in-memory maps from storage for one project. Records
    /// that fail to deserialize are skipped with a warning rather than
    /// failing the whole load.
    #[instrument(skip(self))]
    pub async fn load_project(&self, project_id: &str) -> Result<(), EngineError> {
        self.load_collection(project_id, &self.tables).await?;
        self.load_collection(project_id, &self.endpoints).await?;
        self.load_collection(project_id, &self.variables).await?;
        self.load_collection(project_id, &self.transformers).await?;
        debug!(
            tables = self.tables.len(),
            endpoints = self.endpoints.len(),
            variables = self.variables.len(),
            transformers = self.transformers.len(),
            "project loaded"
        );
        Ok(())
    }

    async fn load_collection<T: Record>(
        &self,
        project_id: &str,
        map: &DashMap<EntityId, T>,
    ) -> Result<(), EngineError> {
        let records = self.storage.list(T::COLLECTION, Some(project_id)).await?;
        for raw in records {
            match serde_json::from_value::<T>(raw) {
                Ok(record) => {
                    map.insert(record.id().to_string(), record);
                }
                Err(e) => warn!(collection = T::COLLECTION, error = %e, "skipping corrupt record"),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Generic persist-then-commit helpers
    // ------------------------------------------------------------------

    async fn persist_create<T: Record>(
        &self,
        map: &DashMap<EntityId, T>,
        record: T,
    ) -> Result<T, EngineError> {
        let value = serde_json::to_value(&record)
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        self.storage.insert(T::COLLECTION, value.clone()).await?;

        map.insert(record.id().to_string(), record.clone());
        self.broadcast.publish(ChangeEvent {
            kind: T::CHANGE,
            id: record.id().to_string(),
            value,
        });
        Ok(record)
    }

    async fn persist_update<T: Record>(
        &self,
        map: &DashMap<EntityId, T>,
        updated: T,
    ) -> Result<T, EngineError> {
        let value = serde_json::to_value(&updated)
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        self.storage
            .update(T::COLLECTION, updated.id(), value.clone())
            .await?;

        map.insert(updated.id().to_string(), updated.clone());
        self.broadcast.publish(ChangeEvent {
            kind: T::CHANGE,
            id: updated.id().to_string(),
            value,
        });
        Ok(updated)
    }

    /// Idempotent: an absent id is Ok(None) with no storage call.
    async fn persist_delete<T: Record>(
        &self,
        map: &DashMap<EntityId, T>,
        id: &str,
    ) -> Result<Option<T>, EngineError> {
        if !map.contains_key(id) {
            return Ok(None);
        }
        self.storage.delete(T::COLLECTION, id).await?;

        let removed = map.remove(id).map(|(_, record)| record);
        if removed.is_some() {
            self.broadcast.publish(ChangeEvent {
                kind: T::CHANGE,
                id: id.to_string(),
                value: Value::Null,
            });
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // DataTables
    // ------------------------------------------------------------------

    pub async fn create_data_table(&self, table: DataTable) -> Result<DataTable, EngineError> {
        validate_name(&table.name)?;
        validate_schema(&table.schema)?;
        self.persist_create(&self.tables, table).await
    }

    pub async fn update_data_table(
        &self,
        id: &str,
        update: &DataTableUpdate,
    ) -> Result<DataTable, EngineError> {
        let mut table = self
            .data_table(id)
            .ok_or_else(|| EngineError::not_found(DataTable::KIND, id))?;
        update.apply(&mut table);
        validate_name(&table.name)?;
        validate_schema(&table.schema)?;
        self.persist_update(&self.tables, table).await
    }

    pub async fn delete_data_table(&self, id: &str) -> Result<Option<DataTable>, EngineError> {
        self.persist_delete(&self.tables, id).await
    }

    pub fn data_table(&self, id: &str) -> Option<DataTable> {
        self.tables.get(id).map(|t| t.clone())
    }

    pub fn list_data_tables(&self, project_id: &str) -> Vec<DataTable> {
        self.tables
            .iter()
            .filter(|t| t.project_id == project_id)
            .map(|t| t.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // ApiEndpoints
    // ------------------------------------------------------------------

    pub async fn create_endpoint(&self, endpoint: ApiEndpoint) -> Result<ApiEndpoint, EngineError> {
        validate_name(&endpoint.name)?;
        self.persist_create(&self.endpoints, endpoint).await
    }

    pub async fn update_endpoint(
        &self,
        id: &str,
        update: &ApiEndpointUpdate,
    ) -> Result<ApiEndpoint, EngineError> {
        let mut endpoint = self
            .endpoint(id)
            .ok_or_else(|| EngineError::not_found(ApiEndpoint::KIND, id))?;
        update.apply(&mut endpoint);
        validate_name(&endpoint.name)?;
        self.persist_update(&self.endpoints, endpoint).await
    }

    pub async fn delete_endpoint(&self, id: &str) -> Result<Option<ApiEndpoint>, EngineError> {
        self.persist_delete(&self.endpoints, id).await
    }

    pub fn endpoint(&self, id: &str) -> Option<ApiEndpoint> {
        self.endpoints.get(id).map(|e| e.clone())
    }

    pub fn list_endpoints(&self, project_id: &str) -> Vec<ApiEndpoint> {
        self.endpoints
            .iter()
            .filter(|e| e.project_id == project_id)
            .map(|e| e.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    pub async fn create_variable(&self, variable: Variable) -> Result<Variable, EngineError> {
        validate_name(&variable.name)?;
        self.check_variable_unique(&variable)?;
        self.persist_create(&self.variables, variable).await
    }

    pub async fn update_variable(
        &self,
        id: &str,
        update: &VariableUpdate,
    ) -> Result<Variable, EngineError> {
        let mut variable = self
            .variable(id)
            .ok_or_else(|| EngineError::not_found(Variable::KIND, id))?;
        update.apply(&mut variable);
        validate_name(&variable.name)?;
        self.check_variable_unique(&variable)?;
        self.persist_update(&self.variables, variable).await
    }

    pub async fn delete_variable(&self, id: &str) -> Result<Option<Variable>, EngineError> {
        self.persist_delete(&self.variables, id).await
    }

    pub fn variable(&self, id: &str) -> Option<Variable> {
        self.variables.get(id).map(|v| v.clone())
    }

    pub fn list_variables(&self, project_id: &str) -> Vec<Variable> {
        self.variables
            .iter()
            .filter(|v| v.project_id == project_id)
            .map(|v| v.clone())
            .collect()
    }

    /// Look a variable up by its identity within a project.
    pub fn find_variable(
        &self,
        project_id: &str,
        scope: VariableScope,
        name: &str,
    ) -> Option<Variable> {
        self.variables
            .iter()
            .find(|v| v.project_id == project_id && v.scope == scope && v.name == name)
            .map(|v| v.clone())
    }

    fn check_variable_unique(&self, candidate: &Variable) -> Result<(), EngineError> {
        let clash = self.variables.iter().any(|v| {
            v.id != candidate.id
                && v.project_id == candidate.project_id
                && v.scope == candidate.scope
                && v.name == candidate.name
        });
        if clash {
            return Err(EngineError::validation(format!(
                "variable '{}' already exists in scope '{}'",
                candidate.name, candidate.scope
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transformers
    // ------------------------------------------------------------------

    pub async fn create_transformer(
        &self,
        transformer: Transformer,
    ) -> Result<Transformer, EngineError> {
        validate_name(&transformer.name)?;
        self.persist_create(&self.transformers, transformer).await
    }

    pub async fn update_transformer(
        &self,
        id: &str,
        update: &TransformerUpdate,
    ) -> Result<Transformer, EngineError> {
        let mut transformer = self
            .transformer(id)
            .ok_or_else(|| EngineError::not_found(Transformer::KIND, id))?;
        update.apply(&mut transformer);
        validate_name(&transformer.name)?;
        self.persist_update(&self.transformers, transformer).await
    }

    pub async fn delete_transformer(&self, id: &str) -> Result<Option<Transformer>, EngineError> {
        self.persist_delete(&self.transformers, id).await
    }

    pub fn transformer(&self, id: &str) -> Option<Transformer> {
        self.transformers.get(id).map(|t| t.clone())
    }

    pub fn list_transformers(&self, project_id: &str) -> Vec<Transformer> {
        self.transformers
            .iter()
            .filter(|t| t.project_id == project_id)
            .map(|t| t.clone())
            .collect()
    }
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::validation("name must not be empty"));
    }
    Ok(())
}

fn validate_schema(schema: &[Field]) -> Result<(), EngineError> {
    let mut seen = std::collections::HashSet::new();
    for field in schema {
        if !seen.insert(field.key.as_str()) {
            return Err(EngineError::validation(format!(
                "duplicate field key '{}' in schema",
                field.key
            )));
        }
    }
    Ok(())
}
