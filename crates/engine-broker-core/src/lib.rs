//! Core abstractions for brokering analytics engine sessions.
//!
//! This crate provides the building blocks shared by transport and session layers:
//! - `EngineError` - the error taxonomy
//! - `ObjectHandle` - generation-tagged remote handles
//! - `ObjectRegistry` - per-context object bookkeeping
//! - `EventBus` - broadcast + history for lifecycle events
//! - `StateStore` and `CredentialSupplier` traits
//! - Configuration structs

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod handle;
pub mod registry;
pub mod snapshot;
pub mod traits;

use std::time::{SystemTime, UNIX_EPOCH};

pub use config::{BrokerConfig, ManagerConfig, TransportConfig};
pub use context::{ContextConfig, ContextMetadata};
pub use error::{CredentialError, EngineError, StorageError};
pub use events::{BrokerEvent, EventBus, EventKind};
pub use handle::{ContextId, GLOBAL_HANDLE, ObjectHandle, SnapshotId};
pub use registry::{ObjectEntry, ObjectRegistry, RegistrySnapshot};
pub use snapshot::{
    FieldSelection, SelectionState, Snapshot, SnapshotSummary, StatePayload, VariableState,
    VariableValue,
};
pub use traits::{CredentialSupplier, NoCredentials, StateStore, StaticCredentials};

/// Current time as Unix epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
