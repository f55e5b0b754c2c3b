//! Transformer pipeline
//!
//! Three strategies, one entry point. Level 1 is a declarative field
//! mapping evaluated in-process, level 2 hands user code to the sandbox
//! host, level 3 pipes rows through an ordered list of the other two.
//! A failing step fails the whole run; callers never see partial output.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::instrument;

use crate::error::EngineError;
use crate::jsonpath;
use crate::sandbox::SandboxHost;
use crate::types::{LevelConfig, Transformer};

/// Runs transformer configs against row sets.
pub struct TransformPipeline {
    sandbox: Arc<dyn SandboxHost>,
    max_rows: usize,
}

impl TransformPipeline {
    pub fn new(sandbox: Arc<dyn SandboxHost>, max_rows: usize) -> Self {
        Self { sandbox, max_rows }
    }

    /// Run a transformer. A disabled transformer returns its input
    /// unchanged and touches nothing.
    #[instrument(skip(self, rows, context), fields(transformer = %transformer.name, rows = rows.len()))]
    pub async fn execute(
        &self,
        transformer: &Transformer,
        rows: Vec<Value>,
        context: Value,
    ) -> Result<Vec<Value>, EngineError> {
        if !transformer.enabled {
            return Ok(rows);
        }
        self.apply_config(&transformer.config, rows, context).await
    }

    /// Run a config directly, ignoring any enabled flag. Used for dry runs.
    pub async fn apply_config(
        &self,
        config: &LevelConfig,
        rows: Vec<Value>,
        context: Value,
    ) -> Result<Vec<Value>, EngineError> {
        if rows.len() > self.max_rows {
            return Err(EngineError::Transform(format!(
                "input of {} rows exceeds the limit of {}",
                rows.len(),
                self.max_rows
            )));
        }
        self.apply_inner(config, rows, context).await
    }

    // Level 3 recurses into this; boxing keeps the future sized.
    fn apply_inner<'a>(
        &'a self,
        config: &'a LevelConfig,
        rows: Vec<Value>,
        context: Value,
    ) -> BoxFuture<'a, Result<Vec<Value>, EngineError>> {
        Box::pin(async move {
            match config {
                LevelConfig::Level1Mapping { field_map } => rows
                    .iter()
                    .map(|row| map_row(row, field_map))
                    .collect::<Result<Vec<_>, _>>(),
                LevelConfig::Level2Transformer { code } => self
                    .sandbox
                    .run(code, rows, context)
                    .await
                    .map_err(|e| EngineError::Transform(e.to_string())),
                LevelConfig::Level3Custom { steps } => {
                    let mut current = rows;
                    for (index, step) in steps.iter().enumerate() {
                        current = self
                            .apply_inner(step, current, context.clone())
                            .await
                            .map_err(|e| {
                                EngineError::Transform(format!("step {index}: {e}"))
                            })?;
                    }
                    Ok(current)
                }
            }
        })
    }
}

/// Build one output row from a level-1 field map. Each map value is a
/// source path, optionally suffixed `|transform`. Missing sources map to
/// null.
fn map_row(
    row: &Value,
    field_map: &indexmap::IndexMap<String, String>,
) -> Result<Value, EngineError> {
    let mut out = serde_json::Map::new();
    for (target, mapping) in field_map {
        let (source, transform) = match mapping.split_once('|') {
            Some((source, transform)) => (source.trim(), Some(transform.trim())),
            None => (mapping.trim(), None),
        };
        let mut value = jsonpath::resolve(row, source).unwrap_or(Value::Null);
        if let Some(name) = transform {
            value = apply_value_transform(value, name)?;
        }
        out.insert(target.clone(), value);
    }
    Ok(Value::Object(out))
}

fn apply_value_transform(value: Value, name: &str) -> Result<Value, EngineError> {
    let transformed = match name {
        "uppercase" => match value {
            Value::String(s) => Value::String(s.to_uppercase()),
            other => other,
        },
        "lowercase" => match value {
            Value::String(s) => Value::String(s.to_lowercase()),
            other => other,
        },
        "trim" => match value {
            Value::String(s) => Value::String(s.trim().to_string()),
            other => other,
        },
        "number" => match value {
            Value::Number(n) => Value::Number(n),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Value::Bool(b) => json!(if b { 1 } else { 0 }),
            _ => Value::Null,
        },
        "boolean" => Value::Bool(is_truthy(&value)),
        "date" => match value {
            Value::String(s) => to_iso_datetime(&s).map(Value::String).unwrap_or(Value::Null),
            Value::Number(n) => n
                .as_i64()
                .and_then(DateTime::from_timestamp_millis)
                .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)))
                .unwrap_or(Value::Null),
            _ => Value::Null,
        },
        other => {
            return Err(EngineError::Transform(format!(
                "unknown value transform '{other}'"
            )))
        }
    };
    Ok(transformed)
}

/// Normalize a date-ish string to an RFC 3339 UTC timestamp. Bare dates
/// are midnight UTC; anything unparseable is None.
fn to_iso_datetime(s: &str) -> Option<String> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(
            dt.with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        );
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    let dt = date.and_hms_opt(0, 0, 0)?.and_utc();
    Some(dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{DenySandbox, MockSandbox};
    use crate::types::LevelConfig;
    use indexmap::IndexMap;

    fn mapping(pairs: &[(&str, &str)]) -> LevelConfig {
        let field_map: IndexMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LevelConfig::Level1Mapping { field_map }
    }

    fn pipeline() -> TransformPipeline {
        TransformPipeline::new(Arc::new(DenySandbox), 10_000)
    }

    #[tokio::test]
    async fn level1_renames_fields() {
        let config = mapping(&[("full_name", "name"), ("years", "age")]);
        let rows = vec![json!({"name": "Ada", "age": 36, "extra": true})];

        let out = pipeline().apply_config(&config, rows, Value::Null).await.unwrap();
        assert_eq!(out, vec![json!({"full_name": "Ada", "years": 36})]);
    }

    #[tokio::test]
    async fn level1_missing_source_maps_to_null() {
        let config = mapping(&[("x", "missing")]);
        let out = pipeline()
            .apply_config(&config, vec![json!({"a": 1})], Value::Null)
            .await
            .unwrap();
        assert_eq!(out, vec![json!({"x": null})]);
    }

    #[tokio::test]
    async fn level1_supports_nested_source_paths() {
        let config = mapping(&[("city", "address.city")]);
        let rows = vec![json!({"address": {"city": "Oslo"}})];
        let out = pipeline().apply_config(&config, rows, Value::Null).await.unwrap();
        assert_eq!(out, vec![json!({"city": "Oslo"})]);
    }

    #[tokio::test]
    async fn level1_value_transforms() {
        let config = mapping(&[
            ("upper", "name|uppercase"),
            ("trimmed", "padded|trim"),
            ("price", "price|number"),
            ("active", "flag|boolean"),
        ]);
        let rows = vec![json!({
            "name": "ada",
            "padded": "  x  ",
            "price": "12.5",
            "flag": ""
        })];

        let out = pipeline().apply_config(&config, rows, Value::Null).await.unwrap();
        assert_eq!(
            out,
            vec![json!({"upper": "ADA", "trimmed": "x", "price": 12.5, "active": false})]
        );
    }

    #[tokio::test]
    async fn level1_date_transform_normalizes_to_iso() {
        let config = mapping(&[("born", "born|date"), ("seen", "seen|date"), ("bad", "bad|date")]);
        let rows = vec![json!({
            "born": "1815-12-10",
            "seen": "2024-03-01T09:30:00+02:00",
            "bad": "not a date"
        })];

        let out = pipeline().apply_config(&config, rows, Value::Null).await.unwrap();
        assert_eq!(
            out,
            vec![json!({
                "born": "1815-12-10T00:00:00.000Z",
                "seen": "2024-03-01T07:30:00.000Z",
                "bad": null
            })]
        );
    }

    #[tokio::test]
    async fn level1_unknown_transform_fails() {
        let config = mapping(&[("x", "a|reverse")]);
        let err = pipeline()
            .apply_config(&config, vec![json!({"a": 1})], Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Transform(_)));
    }

    #[tokio::test]
    async fn level2_runs_in_sandbox() {
        let sandbox = Arc::new(MockSandbox::new());
        sandbox.queue_rows(vec![json!({"doubled": 2})]);
        let pipeline = TransformPipeline::new(Arc::clone(&sandbox) as Arc<dyn SandboxHost>, 10_000);

        let config = LevelConfig::Level2Transformer {
            code: "return rows;".to_string(),
        };
        let out = pipeline
            .apply_config(&config, vec![json!({"n": 1})], json!({"ctx": true}))
            .await
            .unwrap();

        assert_eq!(out, vec![json!({"doubled": 2})]);
        let calls = sandbox.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].context, json!({"ctx": true}));
    }

    #[tokio::test]
    async fn level2_script_error_surfaces_as_transform() {
        let sandbox = Arc::new(MockSandbox::new());
        sandbox.queue_error("ReferenceError: x is not defined");
        let pipeline = TransformPipeline::new(Arc::clone(&sandbox) as Arc<dyn SandboxHost>, 10_000);

        let config = LevelConfig::Level2Transformer {
            code: "x".to_string(),
        };
        let err = pipeline
            .apply_config(&config, vec![], Value::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ReferenceError"));
    }

    #[tokio::test]
    async fn level3_pipes_steps_in_order() {
        let config = LevelConfig::Level3Custom {
            steps: vec![
                mapping(&[("n", "value"), ("tag", "tag")]),
                mapping(&[("final", "n|number")]),
            ],
        };
        let rows = vec![json!({"value": "7", "tag": "a"})];

        let out = pipeline().apply_config(&config, rows, Value::Null).await.unwrap();
        assert_eq!(out, vec![json!({"final": 7.0})]);
    }

    #[tokio::test]
    async fn level3_names_the_failing_step() {
        let config = LevelConfig::Level3Custom {
            steps: vec![mapping(&[("a", "a")]), mapping(&[("b", "a|bogus")])],
        };
        let err = pipeline()
            .apply_config(&config, vec![json!({"a": 1})], Value::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("step 1"));
    }

    #[tokio::test]
    async fn disabled_transformer_is_identity() {
        let mut t = Transformer::new("p1", "noop", mapping(&[("x", "missing")]));
        t.enabled = false;
        let rows = vec![json!({"a": 1})];

        let out = pipeline().execute(&t, rows.clone(), Value::Null).await.unwrap();
        assert_eq!(out, rows);
    }

    #[tokio::test]
    async fn row_cap_is_enforced() {
        let pipeline = TransformPipeline::new(Arc::new(DenySandbox), 2);
        let config = mapping(&[("a", "a")]);
        let rows = vec![json!({}), json!({}), json!({})];
        let err = pipeline
            .apply_config(&config, rows, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Transform(_)));
    }
}
