//! Engine sessions, contexts and snapshot storage.
//!
//! Provides:
//! - `EngineSession` - handle-based operations on one open document
//! - `Context` - one tenant's connection, object registry and saved states
//! - `ContextManager` - create, track and evict contexts
//! - Storage implementations (memory, SQLite)

pub mod context;
pub mod engine;
pub mod manager;
pub mod storage;

pub use context::{Context, ContextInfo, ContextServices};
pub use engine::EngineSession;
pub use manager::ContextManager;
