//! ApiEndpoint executor
//!
//! Builds an HTTP request from a stored endpoint definition plus current
//! variable values, issues it on a shared client, and extracts the
//! relevant payload slice. Failures are surfaced, never retried.

use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::error::EngineError;
use crate::interpolate::{Interpolator, VariableResolver};
use crate::jsonpath;
use crate::limits::EngineLimits;
use crate::types::{ApiEndpoint, HttpMethod};

/// Field names probed, in priority order, when a mapped response is not
/// already an array.
pub const ARRAY_FIELD_CANDIDATES: [&str; 7] =
    ["results", "data", "items", "records", "list", "rows", "entries"];

/// Result of executing an endpoint.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Payload after response mapping and array auto-detection.
    pub data: Value,
    /// Array field discovered during auto-detection. Reported so the
    /// caller may persist it into the endpoint's `data_path`; the executor
    /// never mutates the record itself.
    pub discovered_path: Option<String>,
}

impl FetchOutcome {
    /// The payload as rows. Non-array data becomes a single row; null
    /// becomes no rows.
    pub fn rows(&self) -> Vec<Value> {
        match &self.data {
            Value::Array(rows) => rows.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        }
    }
}

/// Executor with a shared HTTP client and a template cache.
pub struct EndpointExecutor {
    client: reqwest::Client,
    interpolator: Interpolator,
    default_timeout: Duration,
}

impl EndpointExecutor {
    pub fn new(limits: &EngineLimits) -> Self {
        let client = reqwest::Client::builder()
            .timeout(limits.http_timeout)
            .connect_timeout(limits.http_connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(limits.max_redirects))
            .user_agent(concat!("weft/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            interpolator: Interpolator::new(),
            default_timeout: limits.http_timeout,
        }
    }

    /// Execute the endpoint with `resolver` supplying `{{name}}` values.
    ///
    /// Any status outside 200-299 is a failure regardless of body content.
    #[instrument(skip(self, resolver), fields(endpoint = %endpoint.name, method = %endpoint.method))]
    pub async fn execute(
        &self,
        endpoint: &ApiEndpoint,
        resolver: &dyn VariableResolver,
    ) -> Result<FetchOutcome, EngineError> {
        let raw_url = format!("{}{}", endpoint.base_url, endpoint.path);
        let url = self.interpolator.resolve(&raw_url, resolver);
        url::Url::parse(&url)
            .map_err(|e| EngineError::Validation(format!("invalid endpoint url '{url}': {e}")))?;

        let method = match endpoint.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };
        let mut request = self.client.request(method, &url);

        let query: Vec<(String, String)> = endpoint
            .query_params
            .iter()
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| (key.clone(), self.interpolator.resolve(value, resolver)))
            .collect();
        if !query.is_empty() {
            request = request.query(&query);
        }

        for (key, value) in &endpoint.headers {
            if key.is_empty() {
                continue;
            }
            request = request.header(key, self.interpolator.resolve(value, resolver));
        }

        if let Some(body) = &endpoint.body {
            request = request.body(self.interpolator.resolve(body, resolver));
        }

        let timeout = endpoint
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        request = request.timeout(timeout);

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Network(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Network(format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("request failed")
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| EngineError::Network(format!("invalid JSON response: {e}")))?;

        Ok(extract_payload(&body, endpoint.response_mapping.data_path.as_deref()))
    }
}

/// Apply the response mapping and, when the result is not an array, probe
/// common field names for a nested record array.
fn extract_payload(body: &Value, data_path: Option<&str>) -> FetchOutcome {
    let mut data = match data_path {
        Some(path) if !path.is_empty() => jsonpath::resolve(body, path).unwrap_or(Value::Null),
        _ => body.clone(),
    };

    let mut discovered_path = None;
    if !data.is_array() && data.is_object() {
        for field in ARRAY_FIELD_CANDIDATES {
            let is_match = data
                .get(field)
                .and_then(Value::as_array)
                .is_some_and(|a| !a.is_empty());
            if is_match {
                debug!(field, "auto-detected array field in response");
                data = data[field].clone();
                discovered_path = Some(field.to_string());
                break;
            }
        }
    }

    FetchOutcome {
        data,
        discovered_path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn data_path_extracts_slice() {
        let body = json!({"payload": {"users": [{"id": 1}]}});
        let outcome = extract_payload(&body, Some("payload.users"));
        assert_eq!(outcome.data, json!([{"id": 1}]));
        assert!(outcome.discovered_path.is_none());
    }

    #[test]
    fn missing_data_path_yields_null() {
        let body = json!({"a": 1});
        let outcome = extract_payload(&body, Some("b.c"));
        assert_eq!(outcome.data, Value::Null);
        assert!(outcome.rows().is_empty());
    }

    #[test]
    fn auto_detects_results_field() {
        let body = json!({"results": [{"id": 1, "name": "A"}], "count": 1});
        let outcome = extract_payload(&body, None);
        assert_eq!(outcome.data, json!([{"id": 1, "name": "A"}]));
        assert_eq!(outcome.discovered_path.as_deref(), Some("results"));
    }

    #[test]
    fn candidates_probed_in_priority_order() {
        let body = json!({"items": [{"b": 2}], "results": [{"a": 1}]});
        let outcome = extract_payload(&body, None);
        // "results" outranks "items" regardless of key order
        assert_eq!(outcome.discovered_path.as_deref(), Some("results"));
    }

    #[test]
    fn empty_candidate_arrays_are_skipped() {
        let body = json!({"results": [], "rows": [{"a": 1}]});
        let outcome = extract_payload(&body, None);
        assert_eq!(outcome.discovered_path.as_deref(), Some("rows"));
    }

    #[test]
    fn array_body_passes_through() {
        let body = json!([{"id": 1}]);
        let outcome = extract_payload(&body, None);
        assert_eq!(outcome.data, body);
        assert!(outcome.discovered_path.is_none());
    }

    #[test]
    fn scalar_data_becomes_single_row() {
        let outcome = FetchOutcome {
            data: json!({"id": 1}),
            discovered_path: None,
        };
        assert_eq!(outcome.rows(), vec![json!({"id": 1})]);
    }
}
