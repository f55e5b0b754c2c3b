//! Engine facade
//!
//! Wires the entity store, the runtime manager, the endpoint executor,
//! the variable runtime, and the transform pipeline together, and owns
//! the cross-cutting behavior none of them can do alone: cascades on
//! delete, variable snapshots for interpolation, endpoint-to-table
//! routing, and the auto-refresh timer tasks.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::binding;
use crate::broadcast::{Broadcast, ChangeEvent, ChangeKind, NullBroadcast};
use crate::columns::{self, DetectedColumn};
use crate::endpoint::{EndpointExecutor, FetchOutcome};
use crate::error::EngineError;
use crate::interpolate::MapResolver;
use crate::limits::EngineLimits;
use crate::runtime::{DataTableRuntime, TableState};
use crate::sandbox::{DenySandbox, SandboxHost};
use crate::shape::RowShape;
use crate::storage::{MemoryStorage, Storage};
use crate::store::EntityStore;
use crate::transform::TransformPipeline;
use crate::types::{
    ApiEndpoint, ApiEndpointUpdate, DataBinding, DataTable, DataTableUpdate, ResponseMapping,
    Transformer, TransformerUpdate, Variable, VariableScope, VariableUpdate,
};
use crate::variables::{KeyValue, MemoryKeyValue, VariableRuntime};

/// Collaborators and limits for an engine instance.
pub struct EngineConfig {
    pub storage: Arc<dyn Storage>,
    pub broadcast: Arc<dyn Broadcast>,
    pub key_value: Arc<dyn KeyValue>,
    pub sandbox: Arc<dyn SandboxHost>,
    pub limits: EngineLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage: Arc::new(MemoryStorage::new()),
            broadcast: Arc::new(NullBroadcast),
            key_value: Arc::new(MemoryKeyValue::new()),
            sandbox: Arc::new(DenySandbox),
            limits: EngineLimits::default(),
        }
    }
}

pub struct Engine {
    store: EntityStore,
    runtime: DataTableRuntime,
    executor: EndpointExecutor,
    variables: VariableRuntime,
    pipeline: TransformPipeline,
    broadcast: Arc<dyn Broadcast>,
    // handed to spawned timer tasks; they upgrade per tick and exit once
    // the engine is gone
    self_ref: Weak<Engine>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let executor = EndpointExecutor::new(&config.limits);
        Arc::new_cyclic(|self_ref| Self {
            store: EntityStore::new(config.storage, Arc::clone(&config.broadcast)),
            runtime: DataTableRuntime::new(Arc::clone(&config.broadcast)),
            executor,
            variables: VariableRuntime::new(config.key_value),
            pipeline: TransformPipeline::new(config.sandbox, config.limits.max_transform_rows),
            broadcast: config.broadcast,
            self_ref: self_ref.clone(),
        })
    }

    /// Hydrate entity definitions from storage and start refresh timers
    /// for the tables that want them.
    #[instrument(skip(self))]
    pub async fn load_project(&self, project_id: &str) -> Result<(), EngineError> {
        self.store.load_project(project_id).await?;
        for table in self.store.list_data_tables(project_id) {
            self.sync_refresh_timer(&table);
        }
        info!(project_id, "project loaded");
        Ok(())
    }

    /// Cancel all timers and drop all runtime state. Entity definitions
    /// survive in storage.
    pub fn dispose(&self) {
        self.runtime.dispose();
    }

    // ------------------------------------------------------------------
    // DataTables
    // ------------------------------------------------------------------

    pub async fn create_data_table(&self, table: DataTable) -> Result<DataTable, EngineError> {
        let table = self.store.create_data_table(table).await?;
        self.sync_refresh_timer(&table);
        Ok(table)
    }

    pub async fn update_data_table(
        &self,
        id: &str,
        update: &DataTableUpdate,
    ) -> Result<DataTable, EngineError> {
        let before = self.store.data_table(id).map(|t| t.refresh_interval_ms);
        let table = self.store.update_data_table(id, update).await?;
        // only an interval change restarts the timer; unrelated updates
        // keep the current schedule
        if before != Some(table.refresh_interval_ms) {
            self.sync_refresh_timer(&table);
        }
        Ok(table)
    }

    /// Delete a table and its runtime state, cache, and timer.
    pub async fn delete_data_table(&self, id: &str) -> Result<(), EngineError> {
        if self.store.delete_data_table(id).await?.is_some() {
            self.runtime.drop_table(id);
        }
        Ok(())
    }

    pub fn data_table(&self, id: &str) -> Option<DataTable> {
        self.store.data_table(id)
    }

    pub fn list_data_tables(&self, project_id: &str) -> Vec<DataTable> {
        self.store.list_data_tables(project_id)
    }

    /// Current runtime load state, Idle for tables never loaded.
    pub fn table_state(&self, table_id: &str) -> TableState {
        self.runtime.state(table_id)
    }

    /// Rows a consumer should render right now: mock rows when the table
    /// is in mock mode, the runtime cache otherwise.
    pub fn resolved_rows(&self, table: &DataTable) -> Vec<Value> {
        if table.use_mock_data {
            table.mock_data.clone()
        } else {
            self.runtime.state(&table.id).data
        }
    }

    /// Load (or reload) a table's rows through its configured source.
    ///
    /// Source failures are captured into the returned state rather than
    /// raised; only a missing table id is an error.
    pub async fn load_data_table(&self, id: &str) -> Result<TableState, EngineError> {
        let table = self
            .store
            .data_table(id)
            .ok_or_else(|| EngineError::not_found("DataTable", id))?;
        // mock tables go straight to success, no loading phase
        if table.use_mock_data {
            self.runtime.set_data(id, table.mock_data.clone());
            return Ok(self.runtime.state(id));
        }
        Ok(self.runtime.load_with(id, self.fetch_rows(&table)).await)
    }

    /// Reload a table's rows through its source. An alias of
    /// [`Engine::load_data_table`] for call sites refreshing an
    /// already-loaded table; the previous rows stay visible while the
    /// reload is in flight.
    pub async fn refresh_data_table(&self, id: &str) -> Result<TableState, EngineError> {
        self.load_data_table(id).await
    }

    /// Register a rendering component as a consumer; idempotent per
    /// component id. The transition to one consumer triggers an initial
    /// load.
    pub async fn register_consumer(
        &self,
        table_id: &str,
        component_id: &str,
    ) -> Result<TableState, EngineError> {
        let had_consumers = self.runtime.consumer_count(table_id) > 0;
        self.runtime.register_consumer(table_id, component_id);
        if !had_consumers {
            return self.load_data_table(table_id).await;
        }
        Ok(self.runtime.state(table_id))
    }

    /// Unregister a consuming component. Cached rows are kept for the
    /// next one.
    pub fn unregister_consumer(&self, table_id: &str, component_id: &str) {
        self.runtime.unregister_consumer(table_id, component_id);
    }

    pub fn consumer_count(&self, table_id: &str) -> usize {
        self.runtime.consumer_count(table_id)
    }

    /// Resolve live rows for one load attempt without touching runtime
    /// state.
    async fn fetch_rows(&self, table: &DataTable) -> Result<Vec<Value>, EngineError> {
        let endpoint_id = table.endpoint_id.as_deref().ok_or_else(|| {
            EngineError::SourceUnavailable {
                table: table.name.clone(),
                reason: "no endpoint configured".to_string(),
            }
        })?;
        let endpoint =
            self.store
                .endpoint(endpoint_id)
                .ok_or_else(|| EngineError::SourceUnavailable {
                    table: table.name.clone(),
                    reason: format!("endpoint '{endpoint_id}' does not exist"),
                })?;

        let outcome = self.execute_fetch(&endpoint).await?;
        Ok(outcome.rows())
    }

    /// (Re)start or cancel the table's auto-refresh timer to match its
    /// definition. Ticks that find no registered consumers are skipped.
    fn sync_refresh_timer(&self, table: &DataTable) {
        match table.refresh_interval_ms {
            Some(ms) if ms > 0 => {
                let interval = Duration::from_millis(ms);
                let weak = self.self_ref.clone();
                let table_id = table.id.clone();
                let handle = tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(interval).await;
                        let Some(engine) = weak.upgrade() else {
                            break;
                        };
                        if engine.runtime.consumer_count(&table_id) == 0 {
                            continue;
                        }
                        debug!(table_id = %table_id, "auto-refresh tick");
                        if engine.load_data_table(&table_id).await.is_err() {
                            break;
                        }
                    }
                });
                self.runtime.set_timer(&table.id, handle);
            }
            _ => self.runtime.clear_timer(&table.id),
        }
    }

    // ------------------------------------------------------------------
    // ApiEndpoints
    // ------------------------------------------------------------------

    pub async fn create_endpoint(&self, endpoint: ApiEndpoint) -> Result<ApiEndpoint, EngineError> {
        self.store.create_endpoint(endpoint).await
    }

    pub async fn update_endpoint(
        &self,
        id: &str,
        update: &ApiEndpointUpdate,
    ) -> Result<ApiEndpoint, EngineError> {
        self.store.update_endpoint(id, update).await
    }

    /// Delete an endpoint. Tables referencing it keep their dangling id
    /// and fail subsequent loads with a source error.
    pub async fn delete_endpoint(&self, id: &str) -> Result<(), EngineError> {
        self.store.delete_endpoint(id).await?;
        Ok(())
    }

    pub fn endpoint(&self, id: &str) -> Option<ApiEndpoint> {
        self.store.endpoint(id)
    }

    pub fn list_endpoints(&self, project_id: &str) -> Vec<ApiEndpoint> {
        self.store.list_endpoints(project_id)
    }

    /// Execute an endpoint on demand. When the endpoint names a target
    /// table, the mapped rows are written into that table's runtime cache.
    pub async fn execute_endpoint(&self, id: &str) -> Result<FetchOutcome, EngineError> {
        let endpoint = self
            .store
            .endpoint(id)
            .ok_or_else(|| EngineError::not_found("ApiEndpoint", id))?;

        let outcome = self.execute_fetch(&endpoint).await?;

        if let Some(target) = &endpoint.target_data_table {
            if self.store.data_table(target).is_some() {
                self.runtime.set_data(target, outcome.rows());
            } else {
                warn!(endpoint = %endpoint.name, target, "target table does not exist");
            }
        }
        Ok(outcome)
    }

    /// Execute with the project's current variable values; when array
    /// auto-detection finds a path on an endpoint that had none, persist it
    /// so later executions extract directly.
    async fn execute_fetch(&self, endpoint: &ApiEndpoint) -> Result<FetchOutcome, EngineError> {
        let resolver = self.variable_snapshot(&endpoint.project_id).await;
        let outcome = self.executor.execute(endpoint, &resolver).await?;

        let path_unset = endpoint
            .response_mapping
            .data_path
            .as_deref()
            .map_or(true, str::is_empty);
        if path_unset {
            if let Some(discovered) = &outcome.discovered_path {
                let update = ApiEndpointUpdate {
                    response_mapping: Some(ResponseMapping {
                        data_path: Some(discovered.clone()),
                    }),
                    ..Default::default()
                };
                if let Err(e) = self.store.update_endpoint(&endpoint.id, &update).await {
                    warn!(endpoint = %endpoint.name, error = %e,
                        "failed to persist discovered data path");
                }
            }
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    pub async fn create_variable(&self, variable: Variable) -> Result<Variable, EngineError> {
        self.store.create_variable(variable).await
    }

    pub async fn update_variable(
        &self,
        id: &str,
        update: &VariableUpdate,
    ) -> Result<Variable, EngineError> {
        let before = self
            .store
            .variable(id)
            .ok_or_else(|| EngineError::not_found("Variable", id))?;
        let after = self.store.update_variable(id, update).await?;
        // a rename or scope move orphans the old runtime key
        if before.storage_key() != after.storage_key() {
            self.variables.remove(&before).await;
        }
        Ok(after)
    }

    /// Delete a variable and clear its runtime and persisted values.
    pub async fn delete_variable(&self, id: &str) -> Result<(), EngineError> {
        if let Some(variable) = self.store.delete_variable(id).await? {
            self.variables.remove(&variable).await;
        }
        Ok(())
    }

    pub fn variable(&self, id: &str) -> Option<Variable> {
        self.store.variable(id)
    }

    pub fn list_variables(&self, project_id: &str) -> Vec<Variable> {
        self.store.list_variables(project_id)
    }

    pub fn find_variable(
        &self,
        project_id: &str,
        scope: VariableScope,
        name: &str,
    ) -> Option<Variable> {
        self.store.find_variable(project_id, scope, name)
    }

    /// Effective value of a variable: runtime, then persisted, then default.
    pub async fn variable_value(&self, id: &str) -> Result<Value, EngineError> {
        let variable = self
            .store
            .variable(id)
            .ok_or_else(|| EngineError::not_found("Variable", id))?;
        Ok(self.variables.get(&variable).await)
    }

    /// Set a variable's runtime value, writing through to durable storage
    /// for persisted variables.
    pub async fn set_variable_value(&self, id: &str, value: Value) -> Result<(), EngineError> {
        let variable = self
            .store
            .variable(id)
            .ok_or_else(|| EngineError::not_found("Variable", id))?;
        self.variables.set(&variable, value.clone()).await;
        self.broadcast.publish(ChangeEvent {
            kind: ChangeKind::Variable,
            id: variable.id.clone(),
            value,
        });
        Ok(())
    }

    /// Current values of every variable in the project, by bare name.
    /// When scopes collide on a name, the most specific scope wins
    /// (component over page over global).
    pub async fn variable_values(&self, project_id: &str) -> HashMap<String, Value> {
        let mut values = HashMap::new();
        for scope in [
            VariableScope::Global,
            VariableScope::Page,
            VariableScope::Component,
        ] {
            for variable in self
                .store
                .list_variables(project_id)
                .into_iter()
                .filter(|v| v.scope == scope)
            {
                let value = self.variables.get(&variable).await;
                values.insert(variable.name, value);
            }
        }
        values
    }

    async fn variable_snapshot(&self, project_id: &str) -> MapResolver {
        MapResolver::new(self.variable_values(project_id).await)
    }

    // ------------------------------------------------------------------
    // Transformers
    // ------------------------------------------------------------------

    pub async fn create_transformer(
        &self,
        transformer: Transformer,
    ) -> Result<Transformer, EngineError> {
        self.store.create_transformer(transformer).await
    }

    pub async fn update_transformer(
        &self,
        id: &str,
        update: &TransformerUpdate,
    ) -> Result<Transformer, EngineError> {
        self.store.update_transformer(id, update).await
    }

    pub async fn delete_transformer(&self, id: &str) -> Result<(), EngineError> {
        self.store.delete_transformer(id).await?;
        Ok(())
    }

    pub fn transformer(&self, id: &str) -> Option<Transformer> {
        self.store.transformer(id)
    }

    pub fn list_transformers(&self, project_id: &str) -> Vec<Transformer> {
        self.store.list_transformers(project_id)
    }

    /// Run a transformer against its configured input table and commit the
    /// output to its output table's runtime cache.
    ///
    /// A failed run writes nothing; a disabled transformer returns its
    /// input unchanged and also writes nothing.
    #[instrument(skip(self))]
    pub async fn run_transformer(&self, id: &str) -> Result<Vec<Value>, EngineError> {
        let transformer = self
            .store
            .transformer(id)
            .ok_or_else(|| EngineError::not_found("Transformer", id))?;

        let (rows, input_meta) = match &transformer.input_data_table {
            Some(input_id) => {
                let input = self
                    .store
                    .data_table(input_id)
                    .ok_or_else(|| EngineError::not_found("DataTable", input_id.clone()))?;
                let meta = json!({"id": input.id, "name": input.name});
                (self.resolved_rows(&input), meta)
            }
            None => (Vec::new(), Value::Null),
        };
        let context = json!({
            "variables": self.variable_values(&transformer.project_id).await,
            "input_table": input_meta,
        });

        let output = self.pipeline.execute(&transformer, rows, context).await?;

        if transformer.enabled {
            if let Some(output_id) = &transformer.output_data_table {
                match self.store.data_table(output_id) {
                    // mock-mode output tables take the rows as their data,
                    // persisted; live ones get a runtime cache write
                    Some(out) if out.use_mock_data => {
                        let update = DataTableUpdate {
                            mock_data: Some(output.clone()),
                            ..Default::default()
                        };
                        self.store.update_data_table(output_id, &update).await?;
                    }
                    Some(_) => self.runtime.set_data(output_id, output.clone()),
                    None => warn!(transformer = %transformer.name, output_id,
                        "output table does not exist, result not committed"),
                }
            }
        }
        Ok(output)
    }

    /// Run a transformer's config against caller-supplied rows without
    /// committing anything, ignoring the enabled flag.
    pub async fn dry_run_transformer(
        &self,
        id: &str,
        rows: Vec<Value>,
    ) -> Result<Vec<Value>, EngineError> {
        let transformer = self
            .store
            .transformer(id)
            .ok_or_else(|| EngineError::not_found("Transformer", id))?;
        let context = json!({
            "variables": self.variable_values(&transformer.project_id).await,
            "input_table": Value::Null,
        });
        self.pipeline
            .apply_config(&transformer.config, rows, context)
            .await
    }

    // ------------------------------------------------------------------
    // Import and bindings
    // ------------------------------------------------------------------

    /// Propose columns for a sample payload.
    pub fn detect_columns(&self, sample: &Value) -> Vec<DetectedColumn> {
        columns::detect_columns(sample)
    }

    /// Create a mock-mode table from detected columns, keeping only the
    /// selected keys on each imported row.
    pub async fn import_detected(
        &self,
        project_id: &str,
        name: &str,
        data: &Value,
        detected: &[DetectedColumn],
    ) -> Result<DataTable, EngineError> {
        let selected_keys: Vec<String> = detected
            .iter()
            .filter(|c| c.selected)
            .map(|c| c.key.clone())
            .collect();

        let mut table = DataTable::new(project_id, name);
        table.schema = columns::columns_to_schema(detected);
        table.mock_data = columns::extract_selected_data(data, &selected_keys);
        table.use_mock_data = true;
        self.create_data_table(table).await
    }

    /// A table's resolved rows after applying a declarative shape
    /// (filter, sort, offset/limit, projection, rename).
    pub fn shaped_rows(&self, table_id: &str, shape: &RowShape) -> Result<Vec<Value>, EngineError> {
        let table = self
            .store
            .data_table(table_id)
            .ok_or_else(|| EngineError::not_found("DataTable", table_id))?;
        Ok(shape.apply(self.resolved_rows(&table)))
    }

    /// Resolve a binding to a value. Missing tables and missing paths
    /// resolve to null.
    pub fn resolve_binding(&self, binding: &DataBinding) -> Value {
        let Some(table) = self.store.data_table(&binding.data_table_id) else {
            return Value::Null;
        };
        let rows = Value::Array(self.resolved_rows(&table));
        binding::resolve(binding, &rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::RecordingBroadcast;
    use crate::sandbox::MockSandbox;
    use crate::types::{LevelConfig, VariableType};
    use indexmap::IndexMap;

    fn engine_with(broadcast: Arc<dyn Broadcast>) -> Arc<Engine> {
        Engine::new(EngineConfig {
            broadcast,
            limits: EngineLimits::testing(),
            ..Default::default()
        })
    }

    fn engine() -> Arc<Engine> {
        engine_with(Arc::new(NullBroadcast))
    }

    fn mock_table(rows: Vec<Value>) -> DataTable {
        let mut table = DataTable::new("p1", "users");
        table.mock_data = rows;
        table
    }

    #[tokio::test]
    async fn mock_table_loads_its_mock_rows() {
        let engine = engine();
        let table = engine
            .create_data_table(mock_table(vec![json!({"id": 1})]))
            .await
            .unwrap();

        let state = engine.load_data_table(&table.id).await.unwrap();
        assert_eq!(state.data, vec![json!({"id": 1})]);
    }

    #[tokio::test]
    async fn live_table_without_endpoint_errors_in_state() {
        let engine = engine();
        let mut table = DataTable::new("p1", "users");
        table.use_mock_data = false;
        let table = engine.create_data_table(table).await.unwrap();

        let state = engine.load_data_table(&table.id).await.unwrap();
        assert_eq!(state.status, crate::runtime::LoadStatus::Error);
        assert!(state.error.unwrap().contains("no endpoint configured"));
    }

    #[tokio::test]
    async fn live_table_with_dangling_endpoint_errors_in_state() {
        let engine = engine();
        let mut table = DataTable::new("p1", "users");
        table.use_mock_data = false;
        table.endpoint_id = Some("gone".to_string());
        let table = engine.create_data_table(table).await.unwrap();

        let state = engine.load_data_table(&table.id).await.unwrap();
        assert_eq!(state.status, crate::runtime::LoadStatus::Error);
        assert!(state.error.unwrap().contains("gone"));
    }

    #[tokio::test]
    async fn first_consumer_triggers_load() {
        let engine = engine();
        let table = engine
            .create_data_table(mock_table(vec![json!(1)]))
            .await
            .unwrap();

        let state = engine.register_consumer(&table.id, "c1").await.unwrap();
        assert_eq!(state.data, vec![json!(1)]);
        assert_eq!(engine.consumer_count(&table.id), 1);

        // second consumer reuses the cache, no reload
        let state = engine.register_consumer(&table.id, "c2").await.unwrap();
        assert_eq!(state.data, vec![json!(1)]);
        assert_eq!(engine.consumer_count(&table.id), 2);

        // re-registering the same component changes nothing
        engine.register_consumer(&table.id, "c2").await.unwrap();
        assert_eq!(engine.consumer_count(&table.id), 2);
    }

    #[tokio::test]
    async fn delete_table_drops_runtime_state() {
        let engine = engine();
        let table = engine
            .create_data_table(mock_table(vec![json!(1)]))
            .await
            .unwrap();
        engine.load_data_table(&table.id).await.unwrap();

        engine.delete_data_table(&table.id).await.unwrap();
        assert!(engine.data_table(&table.id).is_none());
        assert_eq!(
            engine.table_state(&table.id).status,
            crate::runtime::LoadStatus::Idle
        );
    }

    #[tokio::test]
    async fn deleted_variable_reverts_to_default_on_recreate() {
        let engine = engine();
        let variable = engine
            .create_variable(Variable::new("p1", "theme", VariableType::String, json!("dark")))
            .await
            .unwrap();
        engine
            .set_variable_value(&variable.id, json!("light"))
            .await
            .unwrap();
        assert_eq!(engine.variable_value(&variable.id).await.unwrap(), json!("light"));

        engine.delete_variable(&variable.id).await.unwrap();

        let recreated = engine
            .create_variable(Variable::new("p1", "theme", VariableType::String, json!("dark")))
            .await
            .unwrap();
        assert_eq!(
            engine.variable_value(&recreated.id).await.unwrap(),
            json!("dark")
        );
    }

    #[tokio::test]
    async fn variable_rename_clears_old_runtime_key() {
        let engine = engine();
        let variable = engine
            .create_variable(Variable::new("p1", "a", VariableType::String, json!("d")))
            .await
            .unwrap();
        engine.set_variable_value(&variable.id, json!("set")).await.unwrap();

        let update = VariableUpdate {
            name: Some("b".to_string()),
            ..Default::default()
        };
        engine.update_variable(&variable.id, &update).await.unwrap();

        // renamed variable falls back to its default
        assert_eq!(engine.variable_value(&variable.id).await.unwrap(), json!("d"));
    }

    #[tokio::test]
    async fn scope_precedence_prefers_most_specific() {
        let engine = engine();
        engine
            .create_variable(Variable::new("p1", "x", VariableType::String, json!("global")))
            .await
            .unwrap();
        let mut page = Variable::new("p1", "x", VariableType::String, json!("page"));
        page.scope = VariableScope::Page;
        engine.create_variable(page).await.unwrap();

        let values = engine.variable_values("p1").await;
        assert_eq!(values["x"], json!("page"));
    }

    #[tokio::test]
    async fn transformer_commits_to_output_table() {
        let engine = engine();
        let input = engine
            .create_data_table(mock_table(vec![json!({"name": "ada"})]))
            .await
            .unwrap();
        let output = engine
            .create_data_table(DataTable::new("p1", "out"))
            .await
            .unwrap();

        let mut field_map = IndexMap::new();
        field_map.insert("upper".to_string(), "name|uppercase".to_string());
        let mut transformer =
            Transformer::new("p1", "upcase", LevelConfig::Level1Mapping { field_map });
        transformer.input_data_table = Some(input.id.clone());
        transformer.output_data_table = Some(output.id.clone());
        let transformer = engine.create_transformer(transformer).await.unwrap();

        let rows = engine.run_transformer(&transformer.id).await.unwrap();
        assert_eq!(rows, vec![json!({"upper": "ADA"})]);
        // mock-mode output table takes the rows as its persisted data
        assert_eq!(engine.data_table(&output.id).unwrap().mock_data, rows);
    }

    #[tokio::test]
    async fn transformer_writes_live_output_to_runtime_cache() {
        let engine = engine();
        let input = engine
            .create_data_table(mock_table(vec![json!({"a": 1})]))
            .await
            .unwrap();
        let mut out = DataTable::new("p1", "out");
        out.use_mock_data = false;
        let output = engine.create_data_table(out).await.unwrap();

        let mut field_map = IndexMap::new();
        field_map.insert("b".to_string(), "a".to_string());
        let mut transformer =
            Transformer::new("p1", "t", LevelConfig::Level1Mapping { field_map });
        transformer.input_data_table = Some(input.id.clone());
        transformer.output_data_table = Some(output.id.clone());
        let transformer = engine.create_transformer(transformer).await.unwrap();

        engine.run_transformer(&transformer.id).await.unwrap();
        assert_eq!(engine.table_state(&output.id).data, vec![json!({"b": 1})]);
        assert!(engine.data_table(&output.id).unwrap().mock_data.is_empty());
    }

    #[tokio::test]
    async fn failed_transformer_commits_nothing() {
        let sandbox = Arc::new(MockSandbox::new());
        sandbox.queue_error("boom");
        let engine = Engine::new(EngineConfig {
            sandbox: Arc::clone(&sandbox) as Arc<dyn SandboxHost>,
            limits: EngineLimits::testing(),
            ..Default::default()
        });

        let input = engine
            .create_data_table(mock_table(vec![json!({"a": 1})]))
            .await
            .unwrap();
        let output = engine
            .create_data_table(DataTable::new("p1", "out"))
            .await
            .unwrap();

        let mut transformer = Transformer::new(
            "p1",
            "bad",
            LevelConfig::Level2Transformer {
                code: "throw".to_string(),
            },
        );
        transformer.input_data_table = Some(input.id.clone());
        transformer.output_data_table = Some(output.id.clone());
        let transformer = engine.create_transformer(transformer).await.unwrap();

        assert!(engine.run_transformer(&transformer.id).await.is_err());
        assert!(engine.data_table(&output.id).unwrap().mock_data.is_empty());
        assert_eq!(
            engine.table_state(&output.id).status,
            crate::runtime::LoadStatus::Idle
        );
    }

    #[tokio::test]
    async fn dry_run_ignores_enabled_and_commits_nothing() {
        let engine = engine();
        let output = engine
            .create_data_table(DataTable::new("p1", "out"))
            .await
            .unwrap();

        let mut field_map = IndexMap::new();
        field_map.insert("b".to_string(), "a".to_string());
        let mut transformer =
            Transformer::new("p1", "t", LevelConfig::Level1Mapping { field_map });
        transformer.enabled = false;
        transformer.output_data_table = Some(output.id.clone());
        let transformer = engine.create_transformer(transformer).await.unwrap();

        let rows = engine
            .dry_run_transformer(&transformer.id, vec![json!({"a": 7})])
            .await
            .unwrap();
        assert_eq!(rows, vec![json!({"b": 7})]);
        assert!(engine.data_table(&output.id).unwrap().mock_data.is_empty());
        assert!(engine.table_state(&output.id).data.is_empty());
    }

    #[tokio::test]
    async fn import_detected_creates_mock_table() {
        let engine = engine();
        let data = json!([
            {"id": 1, "email": "a@x.com", "noise": true},
            {"id": 2, "email": "b@x.com", "noise": false}
        ]);

        let mut detected = engine.detect_columns(&data);
        assert_eq!(detected.len(), 3);
        // deselect the noise column
        detected
            .iter_mut()
            .find(|c| c.key == "noise")
            .unwrap()
            .selected = false;

        let table = engine
            .import_detected("p1", "imported", &data, &detected)
            .await
            .unwrap();
        assert!(table.use_mock_data);
        assert_eq!(table.schema.len(), 2);
        assert_eq!(table.mock_data[0], json!({"id": 1, "email": "a@x.com"}));
    }

    #[tokio::test]
    async fn shaped_rows_filter_and_paginate() {
        let engine = engine();
        let table = engine
            .create_data_table(mock_table(vec![
                json!({"name": "Carol", "age": 41}),
                json!({"name": "Ada", "age": 36}),
                json!({"name": "Dan", "age": 17}),
            ]))
            .await
            .unwrap();

        let shape: RowShape = serde_json::from_value(json!({
            "filters": [{"field": "age", "op": "gte", "value": 18}],
            "sort": {"field": "age", "direction": "asc"},
            "limit": 1,
            "select": ["name"]
        }))
        .unwrap();

        let rows = engine.shaped_rows(&table.id, &shape).unwrap();
        assert_eq!(rows, vec![json!({"name": "Ada"})]);
    }

    #[tokio::test]
    async fn binding_resolves_through_mock_rows() {
        let engine = engine();
        let table = engine
            .create_data_table(mock_table(vec![json!({"user": {"name": "Ada"}})]))
            .await
            .unwrap();

        let binding = DataBinding {
            data_table_id: table.id.clone(),
            path: Some("0.user.name".to_string()),
        };
        assert_eq!(engine.resolve_binding(&binding), json!("Ada"));

        let dangling = DataBinding {
            data_table_id: "missing".to_string(),
            path: None,
        };
        assert_eq!(engine.resolve_binding(&dangling), Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_timer_skips_ticks_without_consumers() {
        let sink = RecordingBroadcast::new();
        let engine = engine_with(Arc::new(sink.clone()));

        let mut table = mock_table(vec![json!(1)]);
        table.refresh_interval_ms = Some(1_000);
        let table = engine.create_data_table(table).await.unwrap();

        let runtime_events = |sink: &RecordingBroadcast| {
            sink.filter_id(&table.id)
                .into_iter()
                .filter(|e| e.value.get("status").is_some())
                .count()
        };

        // ticks with zero consumers do nothing
        tokio::time::advance(Duration::from_secs(3)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(runtime_events(&sink), 0);

        // first consumer loads once (mock loads go straight to success)
        engine.register_consumer(&table.id, "c1").await.unwrap();
        assert_eq!(runtime_events(&sink), 1);

        // one interval, one refresh
        tokio::time::advance(Duration::from_secs(1)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(runtime_events(&sink), 2);

        engine.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_interval_cancels_timer() {
        let sink = RecordingBroadcast::new();
        let engine = engine_with(Arc::new(sink.clone()));

        let mut table = mock_table(vec![json!(1)]);
        table.refresh_interval_ms = Some(1_000);
        let table = engine.create_data_table(table).await.unwrap();
        engine.register_consumer(&table.id, "c1").await.unwrap();

        let update = DataTableUpdate {
            refresh_interval_ms: Some(None),
            ..Default::default()
        };
        engine.update_data_table(&table.id, &update).await.unwrap();

        let before = sink.len();
        tokio::time::advance(Duration::from_secs(5)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(sink.len(), before);

        engine.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_tick_does_not_stop_the_timer() {
        let engine = engine();
        let mut table = DataTable::new("p1", "flaky");
        table.use_mock_data = false;
        table.endpoint_id = Some("gone".to_string());
        table.refresh_interval_ms = Some(1_000);
        let table = engine.create_data_table(table).await.unwrap();

        let state = engine.register_consumer(&table.id, "c1").await.unwrap();
        assert_eq!(state.status, crate::runtime::LoadStatus::Error);

        // a tick that fails leaves the timer running
        tokio::time::advance(Duration::from_secs(1)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            engine.table_state(&table.id).status,
            crate::runtime::LoadStatus::Error
        );

        // once the source recovers, the next tick succeeds
        let update = DataTableUpdate {
            use_mock_data: Some(true),
            mock_data: Some(vec![json!({"ok": true})]),
            ..Default::default()
        };
        engine.update_data_table(&table.id, &update).await.unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        let state = engine.table_state(&table.id);
        assert_eq!(state.status, crate::runtime::LoadStatus::Success);
        assert_eq!(state.data, vec![json!({"ok": true})]);

        engine.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn unrelated_update_keeps_timer_phase() {
        let sink = RecordingBroadcast::new();
        let engine = engine_with(Arc::new(sink.clone()));

        let mut table = mock_table(vec![json!(1)]);
        table.refresh_interval_ms = Some(1_000);
        let table = engine.create_data_table(table).await.unwrap();
        engine.register_consumer(&table.id, "c1").await.unwrap();

        let runtime_events = |sink: &RecordingBroadcast| {
            sink.filter_id(&table.id)
                .into_iter()
                .filter(|e| e.value.get("status").is_some())
                .count()
        };
        assert_eq!(runtime_events(&sink), 1);

        tokio::time::advance(Duration::from_millis(500)).await;
        let update = DataTableUpdate {
            name: Some("renamed".to_string()),
            ..Default::default()
        };
        engine.update_data_table(&table.id, &update).await.unwrap();

        // the tick still lands on the original schedule
        tokio::time::advance(Duration::from_millis(500)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(runtime_events(&sink), 2);

        engine.dispose();
    }

    #[tokio::test]
    async fn refresh_reloads_through_the_source() {
        let engine = engine();
        let table = engine
            .create_data_table(mock_table(vec![json!(1)]))
            .await
            .unwrap();
        engine.load_data_table(&table.id).await.unwrap();

        let update = DataTableUpdate {
            mock_data: Some(vec![json!(2)]),
            ..Default::default()
        };
        engine.update_data_table(&table.id, &update).await.unwrap();

        let state = engine.refresh_data_table(&table.id).await.unwrap();
        assert_eq!(state.data, vec![json!(2)]);
    }

    #[tokio::test]
    async fn load_project_round_trips_definitions() {
        let storage = Arc::new(MemoryStorage::new());
        let first = Engine::new(EngineConfig {
            storage: Arc::clone(&storage) as Arc<dyn Storage>,
            ..Default::default()
        });
        let table = first
            .create_data_table(mock_table(vec![json!(1)]))
            .await
            .unwrap();
        first.dispose();

        let second = Engine::new(EngineConfig {
            storage: Arc::clone(&storage) as Arc<dyn Storage>,
            ..Default::default()
        });
        second.load_project("p1").await.unwrap();
        assert_eq!(second.data_table(&table.id).unwrap().name, "users");
        second.dispose();
    }
}
