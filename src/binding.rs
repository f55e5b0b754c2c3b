//! Data binding resolution
//!
//! A binding points a component prop at a table's resolved rows,
//! optionally narrowed by a dot-separated path. Resolution is total: a
//! missing table or path yields null, never an error.

use serde_json::Value;

use crate::jsonpath;
use crate::types::DataBinding;

/// Narrow a table's resolved value by the binding's path.
pub fn resolve(binding: &DataBinding, table_value: &Value) -> Value {
    match binding.path.as_deref() {
        None | Some("") => table_value.clone(),
        Some(path) => jsonpath::resolve(table_value, path).unwrap_or(Value::Null),
    }
}
