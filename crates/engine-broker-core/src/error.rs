//! Error taxonomy shared by every layer of the broker.
//!
//! Transport errors propagate unchanged through the engine session and the
//! context; the context only adds its own guard errors.

use std::time::Duration;

use thiserror::Error;

use crate::{ContextId, ObjectHandle, SnapshotId};

/// Errors raised by transport, engine session and context operations.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Initial connect (or a reconnect attempt) failed.
    #[error("Connection failed: {0}")]
    Connection(String),
    /// The socket dropped while the call was in flight.
    #[error("Connection lost")]
    ConnectionLost,
    /// No response arrived before the call deadline.
    #[error("Request '{method}' timed out after {after:?}")]
    Timeout { method: String, after: Duration },
    /// The transport was closed explicitly.
    #[error("Transport closed")]
    Closed,
    /// The engine answered with an error frame.
    #[error("Engine error {code}: {message}")]
    Remote { code: i64, message: String },
    /// Handle belongs to an earlier connection generation.
    #[error("Stale handle {handle} (current generation {current_generation})")]
    StaleHandle {
        handle: ObjectHandle,
        current_generation: u64,
    },
    /// Operation attempted on a context that is not connected.
    #[error("Context not connected: {0}")]
    NotConnected(ContextId),
    /// Operation attempted on a context after it was deleted.
    #[error("Context deleted: {0}")]
    ContextDeleted(ContextId),
    /// No snapshot with this id exists.
    #[error("State not found: {0}")]
    StateNotFound(SnapshotId),
    /// Document handshake failed.
    #[error("Session open failed: {0}")]
    SessionOpen(Box<EngineError>),
    /// A multi-step apply stopped part way through.
    #[error("Applying {stage} failed at '{field}' after {applied} step(s): {source}")]
    PartialApply {
        stage: &'static str,
        field: String,
        applied: usize,
        source: Box<EngineError>,
    },
    /// The engine sent something the broker could not make sense of.
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EngineError {
    /// Whether the error came from the connection rather than the engine.
    #[must_use]
    pub const fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::ConnectionLost | Self::Timeout { .. } | Self::Closed
        )
    }
}

/// State store error.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("Snapshot not found: {0}")]
    NotFound(SnapshotId),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Storage error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Credential supplier error.
#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    #[error("Unknown credential type: {0}")]
    UnknownType(String),
    #[error("Credential lookup failed: {0}")]
    Failed(String),
}

impl From<CredentialError> for EngineError {
    fn from(e: CredentialError) -> Self {
        Self::Connection(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_errors_become_connection_errors() {
        let err: EngineError = CredentialError::UnknownType("jwt".into()).into();
        assert!(matches!(err, EngineError::Connection(ref m) if m.contains("jwt")));
        assert!(err.is_connection_failure());
    }

    #[test]
    fn test_partial_apply_names_the_field() {
        let err = EngineError::PartialApply {
            stage: "variables",
            field: "vRegion".into(),
            applied: 2,
            source: Box::new(EngineError::Remote {
                code: 2,
                message: "nope".into(),
            }),
        };
        let text = err.to_string();
        assert!(text.contains("variables"));
        assert!(text.contains("vRegion"));
        assert!(!err.is_connection_failure());
    }
}
