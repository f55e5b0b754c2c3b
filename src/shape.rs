//! Declarative post-load row shaping
//!
//! A shape narrows resolved rows before they reach a consumer: filter,
//! sort, offset/limit, projection, and field rename, applied in that
//! order. Shaping is total and side-effect free; rows that do not match
//! the expected structure simply fall out of filters or sort last.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::jsonpath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    StartsWith,
    EndsWith,
}

/// One predicate over a row field. A missing field compares as null.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowSort {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// The full shape. All parts are optional; an empty shape is identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowShape {
    #[serde(default)]
    pub filters: Vec<RowFilter>,
    #[serde(default)]
    pub sort: Option<RowSort>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Keep only these keys on each row.
    #[serde(default)]
    pub select: Option<Vec<String>>,
    /// Rename keys, source to target, after selection.
    #[serde(default)]
    pub rename: IndexMap<String, String>,
}

impl RowShape {
    pub fn is_identity(&self) -> bool {
        self.filters.is_empty()
            && self.sort.is_none()
            && self.offset.is_none()
            && self.limit.is_none()
            && self.select.is_none()
            && self.rename.is_empty()
    }

    pub fn apply(&self, rows: Vec<Value>) -> Vec<Value> {
        if self.is_identity() {
            return rows;
        }

        let mut rows: Vec<Value> = rows
            .into_iter()
            .filter(|row| self.filters.iter().all(|f| f.matches(row)))
            .collect();

        if let Some(sort) = &self.sort {
            rows.sort_by(|a, b| {
                let left = jsonpath::resolve(a, &sort.field).unwrap_or(Value::Null);
                let right = jsonpath::resolve(b, &sort.field).unwrap_or(Value::Null);
                let ordering = compare_values(&left, &right);
                match sort.direction {
                    SortDirection::Asc => ordering,
                    // nulls stay last under either direction
                    SortDirection::Desc => match (left.is_null(), right.is_null()) {
                        (false, false) => ordering.reverse(),
                        _ => ordering,
                    },
                }
            });
        }

        let offset = self.offset.unwrap_or(0);
        let rows: Vec<Value> = rows
            .into_iter()
            .skip(offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect();

        rows.into_iter()
            .map(|row| self.project(row))
            .collect()
    }

    fn project(&self, row: Value) -> Value {
        let Some(obj) = row.as_object() else {
            return row;
        };

        let mut out = serde_json::Map::new();
        match &self.select {
            Some(keys) => {
                for key in keys {
                    if let Some(value) = obj.get(key) {
                        out.insert(key.clone(), value.clone());
                    }
                }
            }
            None => out = obj.clone(),
        }

        for (from, to) in &self.rename {
            if let Some(value) = out.remove(from) {
                out.insert(to.clone(), value);
            }
        }
        Value::Object(out)
    }
}

impl RowFilter {
    fn matches(&self, row: &Value) -> bool {
        let actual = jsonpath::resolve(row, &self.field).unwrap_or(Value::Null);
        match self.op {
            FilterOp::Eq => actual == self.value,
            FilterOp::Ne => actual != self.value,
            FilterOp::Gt => compare_non_null(&actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare_non_null(&actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lt => compare_non_null(&actual, &self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare_non_null(&actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Contains => match (&actual, &self.value) {
                (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
                (Value::Array(items), needle) => items.contains(needle),
                _ => false,
            },
            FilterOp::StartsWith => match (&actual, &self.value) {
                (Value::String(s), Value::String(p)) => s.starts_with(p.as_str()),
                _ => false,
            },
            FilterOp::EndsWith => match (&actual, &self.value) {
                (Value::String(s), Value::String(p)) => s.ends_with(p.as_str()),
                _ => false,
            },
        }
    }
}

/// Ordering comparisons only apply between two comparable non-null values.
fn compare_non_null(left: &Value, right: &Value) -> Option<Ordering> {
    if left.is_null() || right.is_null() {
        return None;
    }
    match (left, right) {
        (Value::Number(_), Value::Number(_)) | (Value::String(_), Value::String(_)) => {
            Some(compare_values(left, right))
        }
        _ => None,
    }
}

/// Total order for sorting: numbers, then strings, then booleans; null
/// sorts last; anything else keeps its position.
fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> Vec<Value> {
        vec![
            json!({"name": "Carol", "age": 41, "email": "carol@x.com"}),
            json!({"name": "Ada", "age": 36, "email": "ada@x.com"}),
            json!({"name": "Bob", "age": null}),
        ]
    }

    #[test]
    fn empty_shape_is_identity() {
        let shape = RowShape::default();
        assert_eq!(shape.apply(rows()), rows());
    }

    #[test]
    fn filters_combine_with_and() {
        let shape = RowShape {
            filters: vec![
                RowFilter {
                    field: "age".to_string(),
                    op: FilterOp::Gte,
                    value: json!(36),
                },
                RowFilter {
                    field: "name".to_string(),
                    op: FilterOp::StartsWith,
                    value: json!("A"),
                },
            ],
            ..Default::default()
        };
        let out = shape.apply(rows());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["name"], "Ada");
    }

    #[test]
    fn null_never_satisfies_ordering_filters() {
        let shape = RowShape {
            filters: vec![RowFilter {
                field: "age".to_string(),
                op: FilterOp::Lt,
                value: json!(100),
            }],
            ..Default::default()
        };
        // Bob's null age is excluded even though null < 100 in some systems
        assert_eq!(shape.apply(rows()).len(), 2);
    }

    #[test]
    fn sort_asc_puts_nulls_last() {
        let shape = RowShape {
            sort: Some(RowSort {
                field: "age".to_string(),
                direction: SortDirection::Asc,
            }),
            ..Default::default()
        };
        let out = shape.apply(rows());
        assert_eq!(out[0]["name"], "Ada");
        assert_eq!(out[1]["name"], "Carol");
        assert_eq!(out[2]["name"], "Bob");
    }

    #[test]
    fn sort_desc_also_puts_nulls_last() {
        let shape = RowShape {
            sort: Some(RowSort {
                field: "age".to_string(),
                direction: SortDirection::Desc,
            }),
            ..Default::default()
        };
        let out = shape.apply(rows());
        assert_eq!(out[0]["name"], "Carol");
        assert_eq!(out[1]["name"], "Ada");
        assert_eq!(out[2]["name"], "Bob");
    }

    #[test]
    fn offset_and_limit_paginate() {
        let shape = RowShape {
            sort: Some(RowSort {
                field: "name".to_string(),
                direction: SortDirection::Asc,
            }),
            offset: Some(1),
            limit: Some(1),
            ..Default::default()
        };
        let out = shape.apply(rows());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["name"], "Bob");
    }

    #[test]
    fn select_then_rename() {
        let mut rename = IndexMap::new();
        rename.insert("email".to_string(), "contact".to_string());
        let shape = RowShape {
            select: Some(vec!["name".to_string(), "email".to_string()]),
            rename,
            ..Default::default()
        };
        let out = shape.apply(vec![rows().remove(0)]);
        assert_eq!(out[0], json!({"name": "Carol", "contact": "carol@x.com"}));
    }

    #[test]
    fn contains_works_on_strings_and_arrays() {
        let filter = RowFilter {
            field: "tags".to_string(),
            op: FilterOp::Contains,
            value: json!("rust"),
        };
        assert!(filter.matches(&json!({"tags": ["go", "rust"]})));
        assert!(filter.matches(&json!({"tags": "rustacean"})));
        assert!(!filter.matches(&json!({"tags": 3})));
    }

    #[test]
    fn shape_deserializes_from_camel_free_json() {
        let shape: RowShape = serde_json::from_value(json!({
            "filters": [{"field": "age", "op": "gte", "value": 18}],
            "sort": {"field": "name", "direction": "desc"},
            "limit": 10
        }))
        .unwrap();
        assert_eq!(shape.filters[0].op, FilterOp::Gte);
        assert_eq!(shape.sort.unwrap().direction, SortDirection::Desc);
    }
}
