//! Entity records for the data binding engine
//!
//! Rows and payloads are `serde_json::Value` throughout. Schema is data,
//! not a compile-time type: a `Field` describes what a row is expected to
//! contain, it never constrains what a row may contain.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub type EntityId = String;

fn fresh_id() -> EntityId {
    uuid::Uuid::new_v4().to_string()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// DATA TABLE
// ============================================================================

/// Semantic field type, inferred from sample data or authored directly.
///
/// The string-derived types (email, url, image, datetime, date) are ordered
/// by specificity in the inference code; here they are just labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Email,
    Url,
    Image,
    Datetime,
    Date,
}

/// A single column of a DataTable schema. `key` is unique within a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub key: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub label: String,
    #[serde(default)]
    pub required: bool,
}

/// Named tabular dataset, either static ("mock") or backed by a live
/// ApiEndpoint. Runtime load state lives in the runtime manager, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataTable {
    pub id: EntityId,
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub schema: Vec<Field>,
    #[serde(default)]
    pub mock_data: Vec<Value>,
    #[serde(default = "default_true")]
    pub use_mock_data: bool,
    /// Live source. Referenced, never owned: deleting the endpoint leaves
    /// this id dangling and subsequent loads fail with SourceUnavailable.
    #[serde(default)]
    pub endpoint_id: Option<EntityId>,
    /// Auto-refresh cadence in milliseconds. None or 0 disables polling.
    #[serde(default)]
    pub refresh_interval_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DataTable {
    pub fn new(project_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: fresh_id(),
            project_id: project_id.into(),
            name: name.into(),
            schema: Vec::new(),
            mock_data: Vec::new(),
            use_mock_data: true,
            endpoint_id: None,
            refresh_interval_ms: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update for a DataTable. Unset fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataTableUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Vec<Field>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mock_data: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_mock_data: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<Option<EntityId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_interval_ms: Option<Option<u64>>,
}

impl DataTableUpdate {
    pub fn apply(&self, table: &mut DataTable) {
        if let Some(name) = &self.name {
            table.name = name.clone();
        }
        if let Some(schema) = &self.schema {
            table.schema = schema.clone();
        }
        if let Some(mock_data) = &self.mock_data {
            table.mock_data = mock_data.clone();
        }
        if let Some(use_mock_data) = self.use_mock_data {
            table.use_mock_data = use_mock_data;
        }
        if let Some(endpoint_id) = &self.endpoint_id {
            table.endpoint_id = endpoint_id.clone();
        }
        if let Some(interval) = self.refresh_interval_ms {
            table.refresh_interval_ms = interval;
        }
        table.updated_at = Utc::now();
    }
}

// ============================================================================
// API ENDPOINT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How to extract the relevant payload slice from a response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMapping {
    /// Dot-separated path into the parsed JSON body.
    #[serde(default)]
    pub data_path: Option<String>,
}

/// Reusable HTTP request template. Header values, query-param values, the
/// body, and the url may contain `{{variableName}}` placeholders resolved
/// at execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEndpoint {
    pub id: EntityId,
    pub project_id: String,
    pub name: String,
    pub method: HttpMethod,
    pub base_url: String,
    pub path: String,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default)]
    pub query_params: IndexMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub response_mapping: ResponseMapping,
    /// Optional table whose runtime cache receives mapped rows after an
    /// engine-routed execution.
    #[serde(default)]
    pub target_data_table: Option<EntityId>,
    /// Per-endpoint override of the engine's default request timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApiEndpoint {
    pub fn new(
        project_id: impl Into<String>,
        name: impl Into<String>,
        method: HttpMethod,
        base_url: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: fresh_id(),
            project_id: project_id.into(),
            name: name.into(),
            method,
            base_url: base_url.into(),
            path: path.into(),
            headers: IndexMap::new(),
            query_params: IndexMap::new(),
            body: None,
            response_mapping: ResponseMapping::default(),
            target_data_table: None,
            timeout_ms: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiEndpointUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<HttpMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<IndexMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_params: Option<IndexMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mapping: Option<ResponseMapping>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_data_table: Option<Option<EntityId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<Option<u64>>,
}

impl ApiEndpointUpdate {
    pub fn apply(&self, endpoint: &mut ApiEndpoint) {
        if let Some(name) = &self.name {
            endpoint.name = name.clone();
        }
        if let Some(method) = self.method {
            endpoint.method = method;
        }
        if let Some(base_url) = &self.base_url {
            endpoint.base_url = base_url.clone();
        }
        if let Some(path) = &self.path {
            endpoint.path = path.clone();
        }
        if let Some(headers) = &self.headers {
            endpoint.headers = headers.clone();
        }
        if let Some(query_params) = &self.query_params {
            endpoint.query_params = query_params.clone();
        }
        if let Some(body) = &self.body {
            endpoint.body = body.clone();
        }
        if let Some(mapping) = &self.response_mapping {
            endpoint.response_mapping = mapping.clone();
        }
        if let Some(target) = &self.target_data_table {
            endpoint.target_data_table = target.clone();
        }
        if let Some(timeout) = self.timeout_ms {
            endpoint.timeout_ms = timeout;
        }
        endpoint.updated_at = Utc::now();
    }
}

// ============================================================================
// VARIABLE
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableScope {
    #[default]
    Global,
    Page,
    Component,
}

impl VariableScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Page => "page",
            Self::Component => "component",
        }
    }
}

impl fmt::Display for VariableScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

/// Scoped named value with optional cross-session persistence.
///
/// `name` is unique within `(project_id, scope)`. Values that diverge from
/// `default_value` live in the variable runtime store, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub id: EntityId,
    pub project_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: VariableType,
    pub default_value: Value,
    #[serde(default)]
    pub scope: VariableScope,
    #[serde(default)]
    pub persist: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Variable {
    pub fn new(
        project_id: impl Into<String>,
        name: impl Into<String>,
        var_type: VariableType,
        default_value: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: fresh_id(),
            project_id: project_id.into(),
            name: name.into(),
            var_type,
            default_value,
            scope: VariableScope::Global,
            persist: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Composite key used by the runtime store and the durable key-value
    /// surface: `"{scope}:{name}"`.
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.scope, self.name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub var_type: Option<VariableType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<VariableScope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist: Option<bool>,
}

impl VariableUpdate {
    pub fn apply(&self, variable: &mut Variable) {
        if let Some(name) = &self.name {
            variable.name = name.clone();
        }
        if let Some(var_type) = self.var_type {
            variable.var_type = var_type;
        }
        if let Some(default_value) = &self.default_value {
            variable.default_value = default_value.clone();
        }
        if let Some(scope) = self.scope {
            variable.scope = scope;
        }
        if let Some(persist) = self.persist {
            variable.persist = persist;
        }
        variable.updated_at = Utc::now();
    }
}

// ============================================================================
// TRANSFORMER
// ============================================================================

/// Transformation strategy, tagged by level.
///
/// The pipeline matches exhaustively on this union, so adding a level is a
/// compile-time-checked change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum LevelConfig {
    /// Declarative field mapping: output key to source key, optionally
    /// suffixed with a value transform (`"price|number"`).
    Level1Mapping { field_map: IndexMap<String, String> },
    /// User-supplied function body `(rows, context) -> rows`, run inside
    /// the sandbox host.
    Level2Transformer { code: String },
    /// Ordered composition of the two simpler kinds, each step's output
    /// piped into the next step's input.
    Level3Custom { steps: Vec<LevelConfig> },
}

/// A configured transformation from input rows to output rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transformer {
    pub id: EntityId,
    pub project_id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Rows come from this table's resolved value when set.
    #[serde(default)]
    pub input_data_table: Option<EntityId>,
    /// Committed runs write here; a dangling or absent id means the run
    /// produces an anonymous result only.
    #[serde(default)]
    pub output_data_table: Option<EntityId>,
    pub config: LevelConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transformer {
    pub fn new(
        project_id: impl Into<String>,
        name: impl Into<String>,
        config: LevelConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: fresh_id(),
            project_id: project_id.into(),
            name: name.into(),
            enabled: true,
            input_data_table: None,
            output_data_table: None,
            config,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformerUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_data_table: Option<Option<EntityId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_data_table: Option<Option<EntityId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<LevelConfig>,
}

impl TransformerUpdate {
    pub fn apply(&self, transformer: &mut Transformer) {
        if let Some(name) = &self.name {
            transformer.name = name.clone();
        }
        if let Some(enabled) = self.enabled {
            transformer.enabled = enabled;
        }
        if let Some(input) = &self.input_data_table {
            transformer.input_data_table = input.clone();
        }
        if let Some(output) = &self.output_data_table {
            transformer.output_data_table = output.clone();
        }
        if let Some(config) = &self.config {
            transformer.config = config.clone();
        }
        transformer.updated_at = Utc::now();
    }
}

// ============================================================================
// DATA BINDING
// ============================================================================

/// A reference from a consuming component's prop to a DataTable, optionally
/// narrowed by a dot-separated path. Value object, not a stored entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataBinding {
    pub data_table_id: EntityId,
    #[serde(default)]
    pub path: Option<String>,
}
