//! Saved state model.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ContextId, RegistrySnapshot, SnapshotId};

/// Selected values of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSelection {
    pub field: String,
    pub values: Vec<Value>,
}

/// Current selections of a document, one entry per field with selections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionState {
    pub fields: Vec<FieldSelection>,
}

/// Value of one document variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableValue {
    pub name: String,
    pub definition: Value,
}

/// Document variables, in engine order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableState {
    pub variables: Vec<VariableValue>,
}

/// Everything a snapshot captures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatePayload {
    pub selections: SelectionState,
    pub variables: VariableState,
    pub object_registry: RegistrySnapshot,
}

/// A stored snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub context_id: ContextId,
    pub name: String,
    pub description: Option<String>,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    pub payload: StatePayload,
}

impl Snapshot {
    #[must_use]
    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Listing entry for a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub id: SnapshotId,
    pub name: String,
    pub description: Option<String>,
    pub timestamp: i64,
}
