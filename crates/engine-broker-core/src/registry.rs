//! Per-context bookkeeping of engine objects.
//!
//! Pure in-memory state: nothing here talks to the engine. Entries record what
//! the broker created, not whether the remote object is still alive; liveness is
//! decided by the handle's generation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ObjectHandle, now_millis};

/// One tracked object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub handle: ObjectHandle,
    #[serde(rename = "type")]
    pub object_type: String,
    /// Opaque properties, stored and forwarded as given.
    pub properties: Value,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    pub updated_at: i64,
}

/// Serialized form of a whole registry, as stored inside snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistrySnapshot {
    pub entries: Vec<ObjectEntry>,
}

/// Handle -> object bookkeeping for one context.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    entries: HashMap<ObjectHandle, ObjectEntry>,
}

impl ObjectRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly created object, replacing any previous entry for the handle.
    pub fn register(
        &mut self,
        handle: ObjectHandle,
        object_type: impl Into<String>,
        properties: Value,
    ) -> ObjectEntry {
        let now = now_millis();
        let entry = ObjectEntry {
            handle,
            object_type: object_type.into(),
            properties,
            created_at: now,
            updated_at: now,
        };
        if self.entries.insert(handle, entry.clone()).is_some() {
            tracing::debug!(%handle, "Replaced existing registry entry");
        }
        entry
    }

    /// Replace the properties of a tracked object.
    pub fn update(&mut self, handle: &ObjectHandle, properties: Value) -> Option<ObjectEntry> {
        let entry = self.entries.get_mut(handle)?;
        entry.properties = properties;
        entry.updated_at = now_millis().max(entry.updated_at);
        Some(entry.clone())
    }

    /// Stop tracking an object. Returns whether it was tracked.
    pub fn unregister(&mut self, handle: &ObjectHandle) -> bool {
        self.entries.remove(handle).is_some()
    }

    #[must_use]
    pub fn get(&self, handle: &ObjectHandle) -> Option<&ObjectEntry> {
        self.entries.get(handle)
    }

    /// All entries, oldest first.
    #[must_use]
    pub fn all(&self) -> Vec<ObjectEntry> {
        let mut entries: Vec<ObjectEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.handle.cmp(&b.handle))
        });
        entries
    }

    #[must_use]
    pub fn by_type(&self, object_type: &str) -> Vec<ObjectEntry> {
        self.all()
            .into_iter()
            .filter(|e| e.object_type == object_type)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            entries: self.all(),
        }
    }

    /// Replace the whole registry with the snapshot's entries.
    ///
    /// The new map is built before the swap, so the registry is never observed
    /// half-restored.
    pub fn restore(&mut self, snapshot: RegistrySnapshot) {
        let entries = snapshot
            .entries
            .into_iter()
            .map(|e| (e.handle, e))
            .collect();
        self.entries = entries;
    }
}
