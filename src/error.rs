//! Engine error taxonomy

use thiserror::Error;

/// All failure modes surfaced by the engine.
///
/// CRUD errors roll back the attempted in-memory mutation and propagate
/// unmodified. DataTable load errors are captured into the table's runtime
/// status instead of being returned, since many independent consumers
/// observe that state reactively.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed entity on create or update (duplicate variable name in
    /// scope, duplicate field key in a schema, empty name, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Operation on a missing id. Deletes are idempotent and never raise
    /// this; reads and executes on a missing id do.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// A DataTable is configured for a live source whose ApiEndpoint is
    /// missing.
    #[error("source endpoint unavailable for table '{table}': {reason}")]
    SourceUnavailable { table: String, reason: String },

    /// HTTP failure or a status outside 200-299.
    #[error("network error: {0}")]
    Network(String),

    /// Thrown or rejected transformer code, or a malformed level-1 mapping.
    #[error("transform failed: {0}")]
    Transform(String),

    /// Storage collaborator failure.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
