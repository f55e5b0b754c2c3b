//! Dot-separated path resolution over JSON values
//!
//! Response mappings and data bindings address payload slices with paths
//! like `data.items` or `users.0.name`. Numeric segments index arrays.
//! Resolution is total: a path that does not match yields `None`, never an
//! error, because payload shape is runtime data the author cannot be held
//! to.

use serde_json::Value;

/// Resolve a dot-separated path against a value.
///
/// An empty path returns the value itself. Each segment is tried as an
/// object key first, then as an array index when the segment parses as a
/// number.
pub fn resolve(value: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(value.clone());
    }

    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            return None;
        }
        current = match current.get(segment) {
            Some(v) => v,
            None => match segment.parse::<usize>() {
                Ok(idx) => current.get(idx)?,
                Err(_) => return None,
            },
        };
    }
    Some(current.clone())
}

/// Narrow, explicit accessor for a field on a row.
///
/// Rows are expected to be JSON objects; anything else has no fields.
pub fn get_field<'a>(row: &'a Value, key: &str) -> Option<&'a Value> {
    row.as_object().and_then(|obj| obj.get(key))
}
