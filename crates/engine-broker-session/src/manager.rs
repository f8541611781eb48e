//! Context manager: creation, lookup, deletion and idle eviction.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use engine_broker_core::{
    BrokerEvent, ContextConfig, ContextId, EngineError, EventBus, EventKind, ManagerConfig,
};
use tokio::{
    sync::{RwLock, broadcast, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};
use uuid::Uuid;

use crate::context::{Context, ContextInfo, ContextServices};

struct EvictionLoop {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Registry of contexts keyed by id.
pub struct ContextManager {
    services: ContextServices,
    config: ManagerConfig,
    events: Arc<EventBus>,
    contexts: RwLock<HashMap<ContextId, Arc<Context>>>,
    /// Serializes create/delete; listing only takes the map's read lock.
    structural: tokio::sync::Mutex<()>,
    eviction: Mutex<Option<EvictionLoop>>,
    disposed: AtomicBool,
}

impl ContextManager {
    /// Create a new manager. Eviction does not run until `start_eviction`.
    #[must_use]
    pub fn new(services: ContextServices, config: ManagerConfig) -> Self {
        Self::with_events(services, config, Arc::new(EventBus::new()))
    }

    /// Create a manager publishing to an existing event bus.
    #[must_use]
    pub fn with_events(
        services: ContextServices,
        config: ManagerConfig,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            services,
            config,
            events,
            contexts: RwLock::new(HashMap::new()),
            structural: tokio::sync::Mutex::new(()),
            eviction: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Event bus shared by every context of this manager.
    #[must_use]
    pub const fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Live events of all contexts.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Register a new, unconnected context.
    ///
    /// # Errors
    /// Returns `EngineError::Closed` after `dispose`.
    pub async fn create_context(&self, config: ContextConfig) -> Result<Arc<Context>, EngineError> {
        let _structural = self.structural.lock().await;
        if self.disposed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }

        let id = Uuid::new_v4();
        let context = Arc::new(Context::new(
            id,
            config,
            self.services.clone(),
            Arc::clone(&self.events),
        ));
        self.contexts.write().await.insert(id, Arc::clone(&context));

        tracing::info!(
            context_id = %id,
            document_id = %context.config().document_id,
            endpoint = %context.config().endpoint,
            "Context created"
        );
        self.events.emit(BrokerEvent::new(id, EventKind::ContextCreated));
        Ok(context)
    }

    pub async fn get_context(&self, id: ContextId) -> Option<Arc<Context>> {
        self.contexts.read().await.get(&id).cloned()
    }

    pub async fn has_context(&self, id: ContextId) -> bool {
        self.contexts.read().await.contains_key(&id)
    }

    /// Info for every context, oldest first.
    pub async fn list_contexts(&self) -> Vec<ContextInfo> {
        let mut infos: Vec<ContextInfo> = self
            .contexts
            .read()
            .await
            .values()
            .map(|c| c.info())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        infos
    }

    pub async fn len(&self) -> usize {
        self.contexts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.contexts.read().await.is_empty()
    }

    /// Disconnect (if connected) and remove a context. Returns whether it existed.
    pub async fn delete_context(&self, id: ContextId) -> bool {
        let detached = {
            let _structural = self.structural.lock().await;
            self.detach(id).await
        };
        match detached {
            Some(context) => {
                self.finish_delete(&context).await;
                true
            }
            None => false,
        }
    }

    /// Take a context out of the map. It is marked deleted first so nothing
    /// queued on its session can reconnect it.
    async fn detach(&self, id: ContextId) -> Option<Arc<Context>> {
        let context = self.contexts.write().await.remove(&id)?;
        context.mark_deleted();
        Some(context)
    }

    /// Close a detached context's session, then announce the deletion.
    async fn finish_delete(&self, context: &Context) {
        let id = context.id();
        context.disconnect().await;

        if self.config.purge_snapshots_on_delete {
            match self.services.store.clear(id).await {
                Ok(n) => tracing::debug!(context_id = %id, removed = n, "Purged snapshots"),
                Err(e) => tracing::warn!(context_id = %id, "Failed to purge snapshots: {e}"),
            }
        }

        tracing::info!(context_id = %id, "Context deleted");
        self.events.emit(BrokerEvent::new(id, EventKind::ContextDeleted));
    }

    /// One eviction pass: delete every context idle longer than the
    /// inactivity timeout. Returns the evicted ids.
    pub async fn evict_idle(&self) -> Vec<ContextId> {
        let timeout = self.config.inactivity_timeout;
        let candidates: Vec<ContextId> = self
            .contexts
            .read()
            .await
            .values()
            .filter(|c| c.idle_for() > timeout)
            .map(|c| c.id())
            .collect();

        let mut detached = Vec::with_capacity(candidates.len());
        {
            let _structural = self.structural.lock().await;
            for id in candidates {
                // Touched or deleted since the scan
                let still_idle = self
                    .contexts
                    .read()
                    .await
                    .get(&id)
                    .is_some_and(|c| c.idle_for() > timeout);
                if !still_idle {
                    continue;
                }
                if let Some(context) = self.detach(id).await {
                    detached.push(context);
                }
            }
        }

        // Sessions are closed outside the structural lock; a close may wait on
        // an in-flight engine call.
        let mut evicted = Vec::with_capacity(detached.len());
        for context in detached {
            self.finish_delete(&context).await;
            tracing::info!(context_id = %context.id(), ?timeout, "Evicted idle context");
            evicted.push(context.id());
        }
        evicted
    }

    /// Run `evict_idle` every eviction interval until `dispose`.
    ///
    /// The loop holds only a weak reference; dropping the manager ends it.
    pub fn start_eviction(self: &Arc<Self>) {
        let mut slot = self.eviction.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() || self.disposed.load(Ordering::Acquire) {
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let manager: Weak<Self> = Arc::downgrade(self);
        let period = self.config.eviction_interval;

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        let evicted = manager.evict_idle().await;
                        if !evicted.is_empty() {
                            tracing::debug!(count = evicted.len(), "Eviction pass finished");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::debug!("Eviction loop stopped");
        });

        *slot = Some(EvictionLoop { shutdown, task });
    }

    /// Stop eviction and delete every context. Safe to call more than once.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let eviction = self
            .eviction
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(eviction) = eviction {
            let _ = eviction.shutdown.send(true);
            if let Err(e) = eviction.task.await {
                tracing::warn!("Eviction loop ended abnormally: {e}");
            }
        }

        let detached: Vec<Arc<Context>> = {
            let _structural = self.structural.lock().await;
            let ids: Vec<ContextId> = self.contexts.read().await.keys().copied().collect();
            let mut detached = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(context) = self.detach(id).await {
                    detached.push(context);
                }
            }
            detached
        };
        for context in detached {
            self.finish_delete(&context).await;
        }
        tracing::info!("Context manager disposed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use engine_broker_core::{NoCredentials, StateStore};
    use engine_broker_transport::{TransportState, fake::FakeEngine, protocol::methods};
    use serde_json::json;

    use super::*;
    use crate::storage::MemoryStateStore;

    fn manager(
        engine: &FakeEngine,
        config: ManagerConfig,
    ) -> (Arc<ContextManager>, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        let services = ContextServices::new(
            engine.connector(),
            Arc::new(NoCredentials),
            Arc::clone(&store) as Arc<dyn StateStore>,
        );
        (Arc::new(ContextManager::new(services, config)), store)
    }

    fn config(document: &str) -> ContextConfig {
        ContextConfig::new(document, "fake://engine", "")
    }

    #[tokio::test]
    async fn test_create_get_list_delete() {
        let engine = FakeEngine::new();
        let (manager, _) = manager(&engine, ManagerConfig::default());
        let mut events = manager.subscribe();

        let a = manager.create_context(config("D1")).await.unwrap();
        let b = manager.create_context(config("D2")).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(manager.len().await, 2);
        assert!(manager.has_context(a.id()).await);

        let listed: Vec<ContextId> = manager.list_contexts().await.iter().map(|i| i.id).collect();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&a.id()) && listed.contains(&b.id()));

        assert!(manager.delete_context(a.id()).await);
        assert!(!manager.delete_context(a.id()).await);
        assert!(manager.get_context(a.id()).await.is_none());
        assert!(a.is_deleted());
        assert!(matches!(
            a.connect().await,
            Err(EngineError::ContextDeleted(_))
        ));

        let names: Vec<&str> = [
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
        ]
        .iter()
        .map(BrokerEvent::name)
        .collect();
        assert_eq!(names, vec!["context-created", "context-created", "context-deleted"]);
    }

    #[tokio::test]
    async fn test_delete_connected_context_closes_transport_first() {
        let engine = FakeEngine::new();
        let (manager, _) = manager(&engine, ManagerConfig::default());
        let ctx = manager.create_context(config("D1")).await.unwrap();
        ctx.connect().await.unwrap();
        let mut events = manager.subscribe();

        assert!(manager.delete_context(ctx.id()).await);
        assert_eq!(ctx.transport_state(), Some(TransportState::Closed));

        assert_eq!(events.recv().await.unwrap().name(), "disconnected");
        assert_eq!(events.recv().await.unwrap().name(), "context-deleted");
    }

    /// Occupy the context's session with a call the engine never answers.
    async fn hold_session(engine: &FakeEngine, ctx: &Arc<Context>) -> JoinHandle<()> {
        engine.swallow(methods::GET_LAYOUT);
        let saving = tokio::spawn({
            let ctx = Arc::clone(ctx);
            async move {
                let _ = ctx.save_state("S1", None).await;
            }
        });
        while engine.request_count(methods::GET_LAYOUT) == 0 {
            tokio::task::yield_now().await;
        }
        saving
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_behind_pending_delete_is_refused() {
        let engine = FakeEngine::new();
        let (manager, _) = manager(&engine, ManagerConfig::default());
        let ctx = manager.create_context(config("D1")).await.unwrap();
        ctx.connect().await.unwrap();
        let saving = hold_session(&engine, &ctx).await;

        let deleting = tokio::spawn({
            let manager = Arc::clone(&manager);
            let id = ctx.id();
            async move { manager.delete_context(id).await }
        });
        while !ctx.is_deleted() {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            ctx.connect().await,
            Err(EngineError::ContextDeleted(_))
        ));
        assert!(deleting.await.unwrap());
        saving.await.unwrap();

        assert!(!manager.has_context(ctx.id()).await);
        assert!(!ctx.is_connected());
        assert_eq!(ctx.transport_state(), Some(TransportState::Closed));
        assert_eq!(engine.connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_waiting_on_session_sees_delete() {
        let engine = FakeEngine::new();
        let (manager, _) = manager(&engine, ManagerConfig::default());
        let ctx = manager.create_context(config("D1")).await.unwrap();
        ctx.connect().await.unwrap();
        let saving = hold_session(&engine, &ctx).await;

        // Queued on the session before the delete starts
        let connecting = tokio::spawn({
            let ctx = Arc::clone(&ctx);
            async move { ctx.connect().await }
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        assert!(manager.delete_context(ctx.id()).await);
        assert!(matches!(
            connecting.await.unwrap(),
            Err(EngineError::ContextDeleted(_))
        ));
        saving.await.unwrap();

        assert!(!ctx.is_connected());
        assert_eq!(ctx.transport_state(), Some(TransportState::Closed));
        assert_eq!(engine.connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_does_not_block_other_contexts() {
        let engine = FakeEngine::new();
        let (manager, _) = manager(
            &engine,
            ManagerConfig {
                inactivity_timeout: Duration::from_secs(60),
                ..ManagerConfig::default()
            },
        );
        let idle = manager.create_context(config("D1")).await.unwrap();
        idle.connect().await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        let saving = hold_session(&engine, &idle).await;

        let evicting = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.evict_idle().await }
        });
        while manager.has_context(idle.id()).await {
            tokio::task::yield_now().await;
        }

        // The evicted session is still busy; creation goes ahead regardless
        let started = Instant::now();
        let other = manager.create_context(config("D2")).await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(manager.has_context(other.id()).await);

        assert_eq!(evicting.await.unwrap(), vec![idle.id()]);
        saving.await.unwrap();
        assert_eq!(idle.transport_state(), Some(TransportState::Closed));
    }

    #[tokio::test]
    async fn test_purge_snapshots_on_delete() {
        let engine = FakeEngine::new();
        let (manager, store) = manager(
            &engine,
            ManagerConfig {
                purge_snapshots_on_delete: true,
                ..ManagerConfig::default()
            },
        );
        let ctx = manager.create_context(config("D1")).await.unwrap();
        ctx.connect().await.unwrap();
        ctx.save_state("S1", None).await.unwrap();

        manager.delete_context(ctx.id()).await;
        assert!(store.list(ctx.id()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshots_kept_by_default() {
        let engine = FakeEngine::new();
        let (manager, store) = manager(&engine, ManagerConfig::default());
        let ctx = manager.create_context(config("D1")).await.unwrap();
        ctx.connect().await.unwrap();
        ctx.save_state("S1", None).await.unwrap();

        manager.delete_context(ctx.id()).await;
        assert_eq!(store.list(ctx.id()).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_spares_recently_used() {
        let engine = FakeEngine::new();
        let (manager, _) = manager(
            &engine,
            ManagerConfig {
                inactivity_timeout: Duration::from_secs(60),
                ..ManagerConfig::default()
            },
        );
        let idle = manager.create_context(config("D1")).await.unwrap();
        idle.connect().await.unwrap();
        let busy = manager.create_context(config("D2")).await.unwrap();
        busy.connect().await.unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        busy.create_object("Generic", json!({})).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;

        let evicted = manager.evict_idle().await;
        assert_eq!(evicted, vec![idle.id()]);
        assert!(!manager.has_context(idle.id()).await);
        assert_eq!(idle.transport_state(), Some(TransportState::Closed));
        assert!(manager.has_context(busy.id()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_loop_runs_on_interval() {
        let engine = FakeEngine::new();
        let (manager, _) = manager(
            &engine,
            ManagerConfig {
                eviction_interval: Duration::from_secs(60),
                inactivity_timeout: Duration::from_secs(90),
                ..ManagerConfig::default()
            },
        );
        let ctx = manager.create_context(config("D1")).await.unwrap();
        manager.start_eviction();
        manager.start_eviction(); // second call is a no-op

        // First pass at 60s: idle for 60s, kept
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(manager.has_context(ctx.id()).await);

        // Second pass at 120s: idle for 120s, evicted
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!manager.has_context(ctx.id()).await);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let engine = FakeEngine::new();
        let (manager, _) = manager(&engine, ManagerConfig::default());
        manager.start_eviction();
        let ctx = manager.create_context(config("D1")).await.unwrap();
        ctx.connect().await.unwrap();

        manager.dispose().await;
        manager.dispose().await;

        assert!(manager.is_empty().await);
        assert_eq!(ctx.transport_state(), Some(TransportState::Closed));
        assert!(matches!(
            manager.create_context(config("D2")).await,
            Err(EngineError::Closed)
        ));
    }
}
