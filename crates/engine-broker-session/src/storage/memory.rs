//! In-memory snapshot storage.

use std::{
    collections::HashMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use async_trait::async_trait;
use engine_broker_core::{
    ContextId, Snapshot, SnapshotId, SnapshotSummary, StatePayload, StateStore, StorageError,
    now_millis,
};
use uuid::Uuid;

struct Stored {
    /// Insertion order, breaks timestamp ties when listing.
    seq: u64,
    snapshot: Snapshot,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    snapshots: HashMap<SnapshotId, Stored>,
}

/// In-memory storage implementation.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: RwLock<Inner>,
}

impl MemoryStateStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StorageError> {
        self.inner
            .read()
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StorageError> {
        self.inner
            .write()
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save(
        &self,
        context_id: ContextId,
        name: &str,
        description: Option<&str>,
        payload: &StatePayload,
    ) -> Result<SnapshotId, StorageError> {
        let id = Uuid::new_v4();
        let snapshot = Snapshot {
            id,
            context_id,
            name: name.to_string(),
            description: description.map(ToString::to_string),
            timestamp: now_millis(),
            payload: payload.clone(),
        };

        // Fully built before it becomes visible
        let mut inner = self.write()?;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.snapshots.insert(id, Stored { seq, snapshot });

        Ok(id)
    }

    async fn get(&self, id: SnapshotId) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.read()?.snapshots.get(&id).map(|s| s.snapshot.clone()))
    }

    async fn list(&self, context_id: ContextId) -> Result<Vec<SnapshotSummary>, StorageError> {
        let inner = self.read()?;
        let mut stored: Vec<&Stored> = inner
            .snapshots
            .values()
            .filter(|s| s.snapshot.context_id == context_id)
            .collect();

        // Newest first
        stored.sort_by(|a, b| {
            b.snapshot
                .timestamp
                .cmp(&a.snapshot.timestamp)
                .then(b.seq.cmp(&a.seq))
        });

        Ok(stored.into_iter().map(|s| s.snapshot.summary()).collect())
    }

    async fn delete(&self, id: SnapshotId) -> Result<bool, StorageError> {
        Ok(self.write()?.snapshots.remove(&id).is_some())
    }

    async fn clear(&self, context_id: ContextId) -> Result<usize, StorageError> {
        let mut inner = self.write()?;
        let before = inner.snapshots.len();
        inner
            .snapshots
            .retain(|_, s| s.snapshot.context_id != context_id);
        Ok(before - inner.snapshots.len())
    }
}

#[cfg(test)]
mod tests {
    use engine_broker_core::{
        FieldSelection, ObjectHandle, ObjectRegistry, SelectionState, VariableState,
        VariableValue,
    };
    use serde_json::json;

    use super::*;

    fn payload() -> StatePayload {
        let mut registry = ObjectRegistry::new();
        registry.register(ObjectHandle::new(1, 4), "Generic", json!({"a": 1}));
        StatePayload {
            selections: SelectionState {
                fields: vec![FieldSelection {
                    field: "Region".into(),
                    values: vec![json!("North"), json!("South")],
                }],
            },
            variables: VariableState {
                variables: vec![VariableValue {
                    name: "vYear".into(),
                    definition: json!("2024"),
                }],
            },
            object_registry: registry.snapshot(),
        }
    }

    #[tokio::test]
    async fn test_save_then_load_returns_same_payload() {
        let store = MemoryStateStore::new();
        let ctx = Uuid::new_v4();
        let payload = payload();

        let id = store.save(ctx, "S1", Some("first"), &payload).await.unwrap();
        assert_eq!(store.load(id).await.unwrap(), Some(payload));

        let snapshot = store.get(id).await.unwrap().unwrap();
        assert_eq!(snapshot.context_id, ctx);
        assert_eq!(snapshot.description.as_deref(), Some("first"));
    }

    #[test]
    fn test_load_missing() {
        let store = MemoryStateStore::new();
        let loaded = tokio_test::block_on(store.load(Uuid::new_v4()));
        assert_eq!(tokio_test::assert_ok!(loaded), None);
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_scoped() {
        let store = MemoryStateStore::new();
        let ctx = Uuid::new_v4();
        let other = Uuid::new_v4();

        let first = store.save(ctx, "a", None, &StatePayload::default()).await.unwrap();
        let second = store.save(ctx, "b", None, &StatePayload::default()).await.unwrap();
        store.save(other, "c", None, &StatePayload::default()).await.unwrap();

        let listed: Vec<SnapshotId> = store.list(ctx).await.unwrap().iter().map(|s| s.id).collect();
        assert_eq!(listed, vec![second, first]);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let store = MemoryStateStore::new();
        let ctx = Uuid::new_v4();
        let other = Uuid::new_v4();

        let id = store.save(ctx, "a", None, &StatePayload::default()).await.unwrap();
        store.save(ctx, "b", None, &StatePayload::default()).await.unwrap();
        let kept = store.save(other, "c", None, &StatePayload::default()).await.unwrap();

        assert!(store.delete(id).await.unwrap());
        assert!(!store.delete(id).await.unwrap());

        assert_eq!(store.clear(ctx).await.unwrap(), 1);
        assert!(store.list(ctx).await.unwrap().is_empty());
        assert!(store.get(kept).await.unwrap().is_some());
    }
}
