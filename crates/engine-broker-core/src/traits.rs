//! Seams to storage backends and the credential provider.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::{
    ContextId, SnapshotId,
    error::{CredentialError, StorageError},
    snapshot::{Snapshot, SnapshotSummary, StatePayload},
};

/// Trait for snapshot storage backends.
///
/// Implementations must make a completed `save` visible to every later call on
/// the same context, and must never expose a partially written snapshot.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Store a new snapshot and return its id.
    async fn save(
        &self,
        context_id: ContextId,
        name: &str,
        description: Option<&str>,
        payload: &StatePayload,
    ) -> Result<SnapshotId, StorageError>;

    /// Get a snapshot's payload.
    async fn load(&self, id: SnapshotId) -> Result<Option<StatePayload>, StorageError> {
        Ok(self.get(id).await?.map(|s| s.payload))
    }

    /// Get a snapshot with its metadata.
    async fn get(&self, id: SnapshotId) -> Result<Option<Snapshot>, StorageError>;

    /// List a context's snapshots, newest first.
    async fn list(&self, context_id: ContextId) -> Result<Vec<SnapshotSummary>, StorageError>;

    /// Delete one snapshot. Returns whether it existed.
    async fn delete(&self, id: SnapshotId) -> Result<bool, StorageError>;

    /// Delete all snapshots of a context. Returns how many were removed.
    async fn clear(&self, context_id: ContextId) -> Result<usize, StorageError>;
}

/// Supplies authentication headers for engine connections.
///
/// Called once per connect or reconnect attempt.
#[async_trait]
pub trait CredentialSupplier: Send + Sync {
    async fn auth_headers(
        &self,
        credential_type: &str,
    ) -> Result<HashMap<String, String>, CredentialError>;
}

/// Supplier for engines that need no authentication.
#[derive(Debug, Default, Clone)]
pub struct NoCredentials;

#[async_trait]
impl CredentialSupplier for NoCredentials {
    async fn auth_headers(
        &self,
        _credential_type: &str,
    ) -> Result<HashMap<String, String>, CredentialError> {
        Ok(HashMap::new())
    }
}

/// Fixed header sets keyed by credential type.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    headers: HashMap<String, HashMap<String, String>>,
}

impl StaticCredentials {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header for a credential type.
    #[must_use]
    pub fn with_header(
        mut self,
        credential_type: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.headers
            .entry(credential_type.into())
            .or_default()
            .insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl CredentialSupplier for StaticCredentials {
    async fn auth_headers(
        &self,
        credential_type: &str,
    ) -> Result<HashMap<String, String>, CredentialError> {
        self.headers
            .get(credential_type)
            .cloned()
            .ok_or_else(|| CredentialError::UnknownType(credential_type.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_credentials_by_type() {
        let creds = StaticCredentials::new()
            .with_header("jwt", "Authorization", "Bearer abc")
            .with_header("api-key", "X-Api-Key", "k");

        let headers = creds.auth_headers("jwt").await.unwrap();
        assert_eq!(headers.get("Authorization").map(String::as_str), Some("Bearer abc"));
        assert_eq!(headers.len(), 1);

        assert!(matches!(
            creds.auth_headers("cert").await,
            Err(CredentialError::UnknownType(t)) if t == "cert"
        ));
    }

    #[test]
    fn test_no_credentials_is_empty() {
        let headers = tokio_test::block_on(NoCredentials.auth_headers("anything"));
        assert!(headers.unwrap().is_empty());
    }
}
