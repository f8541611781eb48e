//! Per-context configuration and metadata.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a context connects to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextConfig {
    /// Remote document opened on connect.
    pub document_id: String,
    /// Engine endpoint, e.g. `wss://engine.example.com/app`.
    pub endpoint: String,
    /// Passed to the credential supplier on every connect attempt.
    pub credential_type: String,
}

impl ContextConfig {
    #[must_use]
    pub fn new(
        document_id: impl Into<String>,
        endpoint: impl Into<String>,
        credential_type: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            endpoint: endpoint.into(),
            credential_type: credential_type.into(),
        }
    }
}

/// Free-form key/value data callers cache on a context.
///
/// Never sent to the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextMetadata {
    values: HashMap<String, Value>,
}

impl ContextMetadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Set a metadata value, returning the previous one.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_metadata_set_get() {
        let mut meta = ContextMetadata::new();
        assert!(meta.set("layout", json!({"sheets": 3})).is_none());
        assert_eq!(meta.get("layout"), Some(&json!({"sheets": 3})));
        assert_eq!(meta.set("layout", json!(null)), Some(json!({"sheets": 3})));
        assert_eq!(meta.remove("layout"), Some(json!(null)));
        assert!(meta.is_empty());
    }

    #[test]
    fn test_config_wire_names() {
        let config = ContextConfig::new("D1", "ws://localhost:4848/app", "jwt");
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["documentId"], "D1");
        assert_eq!(value["credentialType"], "jwt");
    }
}
