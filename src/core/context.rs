//! Data flowing between units of a workflow run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Key under which workflow parameters are stored.
pub const PARAMS_KEY: &str = "params";

/// Accumulated values of a workflow run.
///
/// Holds the caller's initial values (parameters under [`PARAMS_KEY`]) and
/// the output of every completed unit keyed by its identity. A unit only
/// writes its own key, and only after it finished, so readers downstream
/// always see complete upstream outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowContext {
    values: BTreeMap<String, Value>,
}

impl WorkflowContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context whose only entry is the workflow parameters.
    pub fn with_params(params: Value) -> Self {
        Self::new().with(PARAMS_KEY, params)
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Workflow parameters, if any were supplied.
    pub fn params(&self) -> Option<&Value> {
        self.values.get(PARAMS_KEY)
    }

    /// Look up a single parameter by name.
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params().and_then(|p| p.get(name))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Render the whole context as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}
