//! Weft - data binding and transformation engine for visually built apps

pub mod binding;
pub mod broadcast;
pub mod columns;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod interpolate;
pub mod jsonpath;
pub mod limits;
pub mod runtime;
pub mod sandbox;
pub mod shape;
pub mod storage;
pub mod store;
pub mod transform;
pub mod types;
pub mod variables;

pub use broadcast::{Broadcast, ChangeEvent, ChangeKind, NullBroadcast, RecordingBroadcast};
pub use columns::{detect_columns, DetectedColumn};
pub use endpoint::{EndpointExecutor, FetchOutcome};
pub use engine::{Engine, EngineConfig};
pub use error::EngineError;
pub use interpolate::{Interpolator, MapResolver, VariableResolver};
pub use limits::EngineLimits;
pub use runtime::{DataTableRuntime, LoadStatus, TableState};
pub use sandbox::{DenySandbox, MockSandbox, SandboxHost};
pub use shape::{FilterOp, RowFilter, RowShape, RowSort, SortDirection};
pub use storage::{MemoryStorage, Storage};
pub use store::EntityStore;
pub use transform::TransformPipeline;
pub use types::{
    ApiEndpoint, ApiEndpointUpdate, DataBinding, DataTable, DataTableUpdate, Field, FieldType,
    HttpMethod, LevelConfig, ResponseMapping, Transformer, TransformerUpdate, Variable,
    VariableScope, VariableType, VariableUpdate,
};
pub use variables::{FileKeyValue, KeyValue, MemoryKeyValue, VariableRuntime};
