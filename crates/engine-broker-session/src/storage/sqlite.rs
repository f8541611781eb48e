//! SQLite snapshot storage (feature-gated).
//!
//! One row per snapshot, payload stored as JSON text. A save is a single
//! `INSERT`, so a snapshot is either fully present or absent.

use std::str::FromStr;

use async_trait::async_trait;
use engine_broker_core::{
    ContextId, Snapshot, SnapshotId, SnapshotSummary, StatePayload, StateStore, StorageError,
    now_millis,
};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use uuid::Uuid;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS snapshots (
    id          TEXT PRIMARY KEY NOT NULL,
    context_id  TEXT NOT NULL,
    name        TEXT NOT NULL,
    description TEXT,
    timestamp   INTEGER NOT NULL,
    payload     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS snapshots_context ON snapshots (context_id, timestamp);
";

type SnapshotRow = (String, String, String, Option<String>, i64, String);

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn parse_id(raw: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(raw).map_err(|e| StorageError::Serialization(format!("Bad id {raw}: {e}")))
}

/// SQLite storage implementation.
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Open (creating if needed) the database at `database_url`, e.g.
    /// `sqlite://broker.db`, and ensure the schema exists.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the database cannot be opened.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(backend)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(backend)?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database, mostly for tests.
    ///
    /// # Errors
    /// Returns error if the database cannot be created.
    pub async fn in_memory() -> Result<Self, StorageError> {
        // Every connection to :memory: is its own database, so keep exactly one
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(backend)?;
        Self::with_pool(pool).await
    }

    /// Use an existing pool.
    ///
    /// # Errors
    /// Returns error if the schema cannot be created.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(backend)?;
        Ok(Self { pool })
    }
}

fn into_snapshot(row: SnapshotRow) -> Result<Snapshot, StorageError> {
    let (id, context_id, name, description, timestamp, payload) = row;
    Ok(Snapshot {
        id: parse_id(&id)?,
        context_id: parse_id(&context_id)?,
        name,
        description,
        timestamp,
        payload: serde_json::from_str(&payload)?,
    })
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn save(
        &self,
        context_id: ContextId,
        name: &str,
        description: Option<&str>,
        payload: &StatePayload,
    ) -> Result<SnapshotId, StorageError> {
        let id = Uuid::new_v4();
        let json = serde_json::to_string(payload)?;

        sqlx::query(
            "INSERT INTO snapshots (id, context_id, name, description, timestamp, payload)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(context_id.to_string())
        .bind(name)
        .bind(description)
        .bind(now_millis())
        .bind(json)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(id)
    }

    async fn get(&self, id: SnapshotId) -> Result<Option<Snapshot>, StorageError> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            "SELECT id, context_id, name, description, timestamp, payload
             FROM snapshots WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(into_snapshot).transpose()
    }

    async fn list(&self, context_id: ContextId) -> Result<Vec<SnapshotSummary>, StorageError> {
        let rows: Vec<(String, String, Option<String>, i64)> = sqlx::query_as(
            "SELECT id, name, description, timestamp
             FROM snapshots WHERE context_id = ?
             ORDER BY timestamp DESC, rowid DESC",
        )
        .bind(context_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|(id, name, description, timestamp)| {
                Ok(SnapshotSummary {
                    id: parse_id(&id)?,
                    name,
                    description,
                    timestamp,
                })
            })
            .collect()
    }

    async fn delete(&self, id: SnapshotId) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM snapshots WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear(&self, context_id: ContextId) -> Result<usize, StorageError> {
        let result = sqlx::query("DELETE FROM snapshots WHERE context_id = ?")
            .bind(context_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }
}
