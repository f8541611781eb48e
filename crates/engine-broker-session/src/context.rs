//! One tenant's engine connection, object bookkeeping and saved states.
//!
//! Engine operations on a context are serialized by an async mutex around its
//! `EngineSession`; registry and metadata reads never wait on the engine.

use std::{
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use engine_broker_core::{
    BrokerEvent, ContextConfig, ContextId, ContextMetadata, CredentialSupplier, EngineError,
    EventBus, EventKind, ObjectEntry, ObjectHandle, ObjectRegistry, SnapshotId, SnapshotSummary,
    StatePayload, StateStore, TransportConfig, now_millis,
};
use engine_broker_transport::{
    Connector, Transport, TransportEvent, TransportOptions, TransportState, TransportStatus,
};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::{MappedMutexGuard, MutexGuard, broadcast, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::engine::EngineSession;

/// Collaborators every context is built with.
#[derive(Clone)]
pub struct ContextServices {
    pub connector: Arc<dyn Connector>,
    pub credentials: Arc<dyn CredentialSupplier>,
    pub store: Arc<dyn StateStore>,
    pub transport: TransportConfig,
}

impl ContextServices {
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialSupplier>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            connector,
            credentials,
            store,
            transport: TransportConfig::default(),
        }
    }

    #[must_use]
    pub fn with_transport_config(mut self, config: TransportConfig) -> Self {
        self.transport = config;
        self
    }
}

/// Listing view of a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInfo {
    pub id: ContextId,
    pub config: ContextConfig,
    pub connected: bool,
    pub generation: u64,
    pub object_count: usize,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    pub last_activity: i64,
}

struct Activity {
    at: Instant,
    epoch_ms: i64,
}

/// A context. Shared as `Arc<Context>` by the manager and its callers.
pub struct Context {
    id: ContextId,
    config: ContextConfig,
    services: ContextServices,
    events: Arc<EventBus>,
    created_at: i64,

    session: tokio::sync::Mutex<Option<EngineSession>>,
    status: RwLock<Option<watch::Receiver<TransportStatus>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    /// Last generation seen, so a fresh transport keeps counting up.
    generation: AtomicU64,

    registry: RwLock<ObjectRegistry>,
    metadata: RwLock<ContextMetadata>,
    activity: Mutex<Activity>,
    deleted: AtomicBool,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Create a context in the Created state (not connected).
    #[must_use]
    pub fn new(
        id: ContextId,
        config: ContextConfig,
        services: ContextServices,
        events: Arc<EventBus>,
    ) -> Self {
        let epoch_ms = now_millis();
        Self {
            id,
            config,
            services,
            events,
            created_at: epoch_ms,
            session: tokio::sync::Mutex::new(None),
            status: RwLock::new(None),
            forwarder: Mutex::new(None),
            generation: AtomicU64::new(0),
            registry: RwLock::new(ObjectRegistry::new()),
            metadata: RwLock::new(ContextMetadata::new()),
            activity: Mutex::new(Activity {
                at: Instant::now(),
                epoch_ms,
            }),
            deleted: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ContextId {
        self.id
    }

    #[must_use]
    pub const fn config(&self) -> &ContextConfig {
        &self.config
    }

    #[must_use]
    pub const fn created_at(&self) -> i64 {
        self.created_at
    }

    /// State of the current (or last) transport; `None` before the first connect.
    #[must_use]
    pub fn transport_state(&self) -> Option<TransportState> {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.borrow().state)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport_state() == Some(TransportState::Connected)
    }

    /// Generation of the current connection, or the last one seen.
    #[must_use]
    pub fn generation(&self) -> u64 {
        let live = self
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |s| s.borrow().generation);
        live.max(self.generation.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    /// Last successful operation, Unix epoch milliseconds.
    #[must_use]
    pub fn last_activity(&self) -> i64 {
        self.activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .epoch_ms
    }

    /// Time since the last successful operation.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .at
            .elapsed()
    }

    fn touch(&self) {
        let mut activity = self.activity.lock().unwrap_or_else(PoisonError::into_inner);
        activity.at = Instant::now();
        activity.epoch_ms = now_millis();
    }

    fn emit(&self, kind: EventKind) {
        self.events.emit(BrokerEvent::new(self.id, kind));
    }

    fn ensure_live(&self) -> Result<(), EngineError> {
        if self.is_deleted() {
            Err(EngineError::ContextDeleted(self.id))
        } else {
            Ok(())
        }
    }

    /// The engine session, if connected.
    async fn session(&self) -> Result<MappedMutexGuard<'_, EngineSession>, EngineError> {
        self.ensure_live()?;
        let guard = self.session.lock().await;
        // Deleted while waiting for the lock
        self.ensure_live()?;
        let session = MutexGuard::try_map(guard, |s| s.as_mut())
            .map_err(|_| EngineError::NotConnected(self.id))?;
        if !session.transport().is_connected() {
            return Err(EngineError::NotConnected(self.id));
        }
        Ok(session)
    }

    /// Open an engine session on the configured document.
    ///
    /// A no-op when already connected. A context left Disconnected by a failed
    /// reconnection gets a fresh transport.
    ///
    /// # Errors
    /// Returns whatever `EngineSession::open` returned; the context stays
    /// disconnected.
    pub async fn connect(&self) -> Result<(), EngineError> {
        self.ensure_live()?;
        let mut guard = self.session.lock().await;
        self.ensure_live()?;

        if guard
            .as_ref()
            .is_some_and(|s| s.transport().is_connected())
        {
            self.touch();
            return Ok(());
        }

        if let Some(old) = guard.take() {
            self.generation.fetch_max(old.generation(), Ordering::AcqRel);
            old.close().await;
        }
        self.stop_forwarding();

        let transport = Transport::spawn(
            TransportOptions::new(&self.config.endpoint, Arc::clone(&self.services.connector))
                .credentials(
                    Arc::clone(&self.services.credentials),
                    &self.config.credential_type,
                )
                .config(self.services.transport.clone())
                .initial_generation(self.generation.load(Ordering::Acquire)),
        );
        *self.status.write().unwrap_or_else(PoisonError::into_inner) =
            Some(transport.watch_status());
        self.start_forwarding(transport.subscribe());

        match EngineSession::open(transport.clone(), &self.config.document_id).await {
            Ok(session) => {
                let generation = session.generation();
                self.generation.fetch_max(generation, Ordering::AcqRel);
                *guard = Some(session);
                self.touch();
                tracing::info!(
                    context_id = %self.id,
                    document_id = %self.config.document_id,
                    generation,
                    "Context connected"
                );
                self.emit(EventKind::Connected { generation });
                Ok(())
            }
            Err(e) => {
                self.generation
                    .fetch_max(transport.generation(), Ordering::AcqRel);
                transport.close().await;
                self.stop_forwarding();
                tracing::warn!(context_id = %self.id, error = %e, "Context connect failed");
                self.emit(EventKind::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Engine component version, if connected.
    pub async fn engine_version(&self) -> Option<String> {
        self.session
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.engine_version().map(ToString::to_string))
    }

    /// Close the engine session. A no-op when not connected.
    pub async fn disconnect(&self) {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.take() else {
            return;
        };
        let was_live = matches!(
            session.transport().state(),
            TransportState::Connected | TransportState::Reconnecting
        );

        self.generation
            .fetch_max(session.generation(), Ordering::AcqRel);
        self.stop_forwarding();
        session.close().await;

        if was_live {
            tracing::info!(context_id = %self.id, "Context disconnected");
            self.emit(EventKind::Disconnected);
        }
    }

    /// Translate this context's transport events into broker events.
    fn start_forwarding(&self, mut rx: broadcast::Receiver<TransportEvent>) {
        let id = self.id;
        let events = Arc::clone(&self.events);

        let task = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(context_id = %id, skipped = n, "Transport events lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                for kind in translate(event) {
                    events.emit(BrokerEvent::new(id, kind));
                }
            }
        });

        let previous = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn stop_forwarding(&self) {
        if let Some(task) = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    /// Create an engine object and track it.
    ///
    /// # Errors
    /// Returns `EngineError::NotConnected` unless connected, or the engine error.
    pub async fn create_object(
        &self,
        object_type: &str,
        properties: Value,
    ) -> Result<ObjectHandle, EngineError> {
        let mut session = self.session().await?;
        let handle = session.create_object(object_type, &properties).await?;
        drop(session);

        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(handle, object_type, properties);
        self.touch();
        self.emit(EventKind::ObjectCreated {
            handle,
            object_type: object_type.to_string(),
        });
        Ok(handle)
    }

    /// Destroy an engine object and stop tracking it.
    ///
    /// A stale handle is dropped from the registry (its object is gone with the
    /// old connection) and still reported as `EngineError::StaleHandle`. A
    /// handle the session no longer holds, such as one brought back by
    /// `restore_state`, is dropped from the registry and reported as `false`.
    ///
    /// # Errors
    /// Returns `EngineError::NotConnected`, `EngineError::StaleHandle` or the engine error.
    pub async fn delete_object(&self, handle: ObjectHandle) -> Result<bool, EngineError> {
        let mut session = self.session().await?;
        let result = session.destroy_object(handle).await;
        drop(session);

        match result {
            Ok(existed) => {
                self.registry
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .unregister(&handle);
                self.touch();
                self.emit(EventKind::ObjectDeleted { handle });
                Ok(existed)
            }
            Err(e @ EngineError::StaleHandle { .. }) => {
                self.registry
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .unregister(&handle);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Call a method on an object.
    ///
    /// # Errors
    /// Returns `EngineError::NotConnected`, `EngineError::StaleHandle` or the engine error.
    pub async fn execute_method(
        &self,
        handle: ObjectHandle,
        method: &str,
        params: Value,
    ) -> Result<Value, EngineError> {
        let session = self.session().await?;
        let result = session.invoke_method(handle, method, params).await?;
        drop(session);
        self.touch();
        Ok(result)
    }

    /// Tracked object, from the registry. No engine call.
    #[must_use]
    pub fn get_object(&self, handle: &ObjectHandle) -> Option<ObjectEntry> {
        let entry = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(handle)
            .cloned();
        if entry.is_some() {
            self.touch();
        }
        entry
    }

    #[must_use]
    pub fn objects(&self) -> Vec<ObjectEntry> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .all()
    }

    #[must_use]
    pub fn objects_by_type(&self, object_type: &str) -> Vec<ObjectEntry> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_type(object_type)
    }

    /// Capture selections, variables and the registry as a named snapshot.
    ///
    /// # Errors
    /// Returns `EngineError::NotConnected`, engine errors while reading state,
    /// or `EngineError::Storage`.
    pub async fn save_state(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<SnapshotId, EngineError> {
        let mut session = self.session().await?;
        let selections = session.get_selection_state().await?;
        let variables = session.get_variable_state().await?;
        let object_registry = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot();

        let payload = StatePayload {
            selections,
            variables,
            object_registry,
        };
        let snapshot_id = self
            .services
            .store
            .save(self.id, name, description, &payload)
            .await?;
        drop(session);

        self.touch();
        tracing::info!(context_id = %self.id, %snapshot_id, name, "State saved");
        self.emit(EventKind::StateSaved {
            snapshot_id,
            name: name.to_string(),
        });
        Ok(snapshot_id)
    }

    /// Re-apply a snapshot's selections and variables, then replace the registry
    /// with the snapshot's.
    ///
    /// Restored registry entries are bookkeeping only: their handles keep the
    /// generation they were saved with and are rejected as stale once the
    /// connection has moved on.
    ///
    /// # Errors
    /// - `EngineError::NotConnected` unless connected
    /// - `EngineError::StateNotFound` if no snapshot has this id
    /// - `EngineError::PartialApply` naming the sub-step that failed; the registry is then left untouched
    pub async fn restore_state(&self, snapshot_id: SnapshotId) -> Result<(), EngineError> {
        let mut session = self.session().await?;
        let snapshot = self
            .services
            .store
            .get(snapshot_id)
            .await?
            .filter(|s| s.context_id == self.id)
            .ok_or(EngineError::StateNotFound(snapshot_id))?;
        let payload = snapshot.payload;

        session.set_selection_state(&payload.selections).await?;
        session.set_variable_state(&payload.variables).await?;
        drop(session);

        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .restore(payload.object_registry);

        self.touch();
        tracing::info!(context_id = %self.id, %snapshot_id, "State restored");
        self.emit(EventKind::StateRestored { snapshot_id });
        Ok(())
    }

    /// Saved snapshots, newest first. Works while disconnected.
    ///
    /// # Errors
    /// Returns `EngineError::ContextDeleted` or `EngineError::Storage`.
    pub async fn list_states(&self) -> Result<Vec<SnapshotSummary>, EngineError> {
        self.ensure_live()?;
        Ok(self.services.store.list(self.id).await?)
    }

    /// Delete one of this context's snapshots. Returns whether it existed.
    ///
    /// # Errors
    /// Returns `EngineError::ContextDeleted` or `EngineError::Storage`.
    pub async fn delete_state(&self, snapshot_id: SnapshotId) -> Result<bool, EngineError> {
        self.ensure_live()?;
        let store = &self.services.store;
        match store.get(snapshot_id).await? {
            Some(s) if s.context_id == self.id => Ok(store.delete(snapshot_id).await?),
            _ => Ok(false),
        }
    }

    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<Value> {
        self.metadata
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Set a metadata value, returning the previous one.
    pub fn set_metadata(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.metadata
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set(key, value)
    }

    pub fn remove_metadata(&self, key: &str) -> Option<Value> {
        self.metadata
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    #[must_use]
    pub fn info(&self) -> ContextInfo {
        ContextInfo {
            id: self.id,
            config: self.config.clone(),
            connected: self.is_connected(),
            generation: self.generation(),
            object_count: self
                .registry
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            created_at: self.created_at,
            last_activity: self.last_activity(),
        }
    }

    /// Live events of this context only.
    #[must_use]
    pub fn subscribe(&self) -> BoxStream<'static, BrokerEvent> {
        self.events.subscribe_context(self.id)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.stop_forwarding();
    }
}

/// Broker events for one transport event.
fn translate(event: TransportEvent) -> Vec<EventKind> {
    match event {
        TransportEvent::Dropped { reason } => vec![EventKind::Suspended {
            terminal: false,
            reason,
        }],
        TransportEvent::Reconnecting { attempt, delay } => vec![EventKind::Reconnecting {
            attempt,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        }],
        TransportEvent::Reconnected { generation } => vec![EventKind::Connected { generation }],
        TransportEvent::ReconnectFailed { attempts, error } => vec![
            EventKind::Suspended {
                terminal: true,
                reason: format!("Reconnection failed after {attempts} attempt(s): {error}"),
            },
            EventKind::Disconnected,
        ],
        // Reported by the context itself once the document is open or closed
        TransportEvent::Connected { .. } | TransportEvent::Closed => Vec::new(),
    }
}
