//! Variable interpolation for endpoint templates
//!
//! Url, header values, query-param values, and request bodies may contain
//! `{{variableName}}` placeholders. Templates are tokenized once and the
//! token list is cached, so repeated executions of the same endpoint skip
//! the scan.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

/// Source of current variable values during interpolation.
///
/// Implementations resolve by bare name; scope precedence is the caller's
/// concern (the engine snapshots per-project values into a [`MapResolver`]).
///
/// Resolvers are held across awaits inside spawned refresh tasks, so trait
/// objects must be shareable between threads.
pub trait VariableResolver: Send + Sync {
    fn get(&self, name: &str) -> Option<Value>;
}

/// Prebuilt name-to-value snapshot, the usual resolver at execution time.
#[derive(Debug, Clone, Default)]
pub struct MapResolver {
    values: HashMap<String, Value>,
}

impl MapResolver {
    pub fn new(values: HashMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }
}

impl VariableResolver for MapResolver {
    fn get(&self, name: &str) -> Option<Value> {
        self.values.get(name).cloned()
    }
}

/// A parsed template fragment.
#[derive(Debug, Clone)]
enum Token {
    /// Literal text, stored as a range into the original template.
    Literal(Range<usize>),
    /// `{{name}}` placeholder.
    Var(String),
}

/// Template interpolator with a tokenization cache.
#[derive(Default)]
pub struct Interpolator {
    cache: DashMap<String, Arc<Vec<Token>>>,
}

impl Interpolator {
    pub fn new() -> Self {
        Self::default()
    }

    fn tokenize(&self, template: &str) -> Arc<Vec<Token>> {
        if let Some(cached) = self.cache.get(template) {
            return Arc::clone(&cached);
        }

        let mut tokens = Vec::new();
        let mut literal_start = 0;
        let mut rest = 0;

        while let Some(open) = template[rest..].find("{{") {
            let open = rest + open;
            match template[open + 2..].find("}}") {
                Some(close) => {
                    let close = open + 2 + close;
                    let name = template[open + 2..close].trim();
                    if name.is_empty() {
                        // Empty braces stay literal text
                        rest = close + 2;
                        continue;
                    }
                    if open > literal_start {
                        tokens.push(Token::Literal(literal_start..open));
                    }
                    tokens.push(Token::Var(name.to_string()));
                    literal_start = close + 2;
                    rest = close + 2;
                }
                // Unclosed braces stay literal text
                None => break,
            }
        }
        if literal_start < template.len() {
            tokens.push(Token::Literal(literal_start..template.len()));
        }

        let tokens = Arc::new(tokens);
        self.cache.insert(template.to_string(), Arc::clone(&tokens));
        tokens
    }

    /// Resolve every `{{name}}` in `template` against `resolver`.
    ///
    /// Unresolved names interpolate to an empty string rather than failing,
    /// so a missing variable degrades the request instead of aborting it.
    pub fn resolve(&self, template: &str, resolver: &dyn VariableResolver) -> String {
        let tokens = self.tokenize(template);
        let mut result = String::with_capacity(template.len());

        for token in tokens.iter() {
            match token {
                Token::Literal(range) => result.push_str(&template[range.clone()]),
                Token::Var(name) => {
                    if let Some(value) = resolver.get(name) {
                        result.push_str(&coerce_to_string(&value));
                    }
                }
            }
        }
        result
    }
}

/// Coerce a JSON value into the string form used inside templates.
///
/// Strings interpolate bare (no quotes), null becomes empty, everything
/// else uses its compact JSON encoding.
pub fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
