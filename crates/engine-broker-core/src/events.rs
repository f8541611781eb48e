//! Broadcast + history event bus.
//!
//! Consumers get clones of every event; nothing they do with them reaches back
//! into broker state. Late subscribers can replay recent history first.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::{StreamExt, future};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{ContextId, ObjectHandle, SnapshotId, now_millis};

/// Default number of events kept for replay.
const HISTORY_LEN: usize = 1024;

/// Live channel capacity; slow receivers skip what they miss.
const CHANNEL_CAPACITY: usize = 4096;

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum EventKind {
    ContextCreated,
    ContextDeleted,
    Connected { generation: u64 },
    Disconnected,
    #[serde(rename_all = "camelCase")]
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// The connection dropped unexpectedly. `terminal` means reconnection gave up.
    Suspended { terminal: bool, reason: String },
    #[serde(rename_all = "camelCase")]
    StateSaved { snapshot_id: SnapshotId, name: String },
    #[serde(rename_all = "camelCase")]
    StateRestored { snapshot_id: SnapshotId },
    #[serde(rename_all = "camelCase")]
    ObjectCreated { handle: ObjectHandle, object_type: String },
    ObjectDeleted { handle: ObjectHandle },
    Error { message: String },
}

impl EventKind {
    /// Wire name of the event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ContextCreated => "context-created",
            Self::ContextDeleted => "context-deleted",
            Self::Connected { .. } => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Suspended { .. } => "suspended",
            Self::StateSaved { .. } => "state-saved",
            Self::StateRestored { .. } => "state-restored",
            Self::ObjectCreated { .. } => "object-created",
            Self::ObjectDeleted { .. } => "object-deleted",
            Self::Error { .. } => "error",
        }
    }
}

/// An event with the context it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerEvent {
    pub context_id: ContextId,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl BrokerEvent {
    #[must_use]
    pub fn new(context_id: ContextId, kind: EventKind) -> Self {
        Self {
            context_id,
            timestamp: now_millis(),
            kind,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Event bus with broadcast and replay history.
pub struct EventBus {
    history: RwLock<VecDeque<BrokerEvent>>,
    history_len: usize,
    sender: broadcast::Sender<BrokerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_history(HISTORY_LEN)
    }

    /// Create a bus keeping at most `history_len` events for replay.
    #[must_use]
    pub fn with_history(history_len: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            history: RwLock::new(VecDeque::with_capacity(history_len.min(64))),
            history_len,
            sender,
        }
    }

    /// Push an event to live listeners and history.
    pub fn emit(&self, event: BrokerEvent) {
        tracing::debug!(context_id = %event.context_id, event = event.name(), "Event");
        let _ = self.sender.send(event.clone()); // no listeners is fine

        if self.history_len == 0 {
            return;
        }
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= self.history_len {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Shorthand for `emit(BrokerEvent::new(..))`.
    pub fn emit_for(&self, context_id: ContextId, kind: EventKind) {
        self.emit(BrokerEvent::new(context_id, kind));
    }

    /// Get a receiver for live events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.sender.subscribe()
    }

    /// Live events whose name is in `names`.
    #[must_use]
    pub fn subscribe_to(&self, names: &[&str]) -> futures::stream::BoxStream<'static, BrokerEvent> {
        let names: Vec<String> = names.iter().map(ToString::to_string).collect();
        BroadcastStream::new(self.subscribe())
            .filter_map(move |res| {
                let keep = res
                    .ok()
                    .filter(|e| names.iter().any(|n| n == e.name()));
                future::ready(keep)
            })
            .boxed()
    }

    /// Live events of one context.
    #[must_use]
    pub fn subscribe_context(
        &self,
        context_id: ContextId,
    ) -> futures::stream::BoxStream<'static, BrokerEvent> {
        BroadcastStream::new(self.subscribe())
            .filter_map(move |res| {
                future::ready(res.ok().filter(|e| e.context_id == context_id))
            })
            .boxed()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn history(&self) -> Vec<BrokerEvent> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Stream that yields history first, then live events.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, BrokerEvent> {
        let (history, rx) = (self.history(), self.subscribe());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| future::ready(res.ok()));

        hist.chain(live).boxed()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_event_wire_format() {
        let id = Uuid::nil();
        let event = BrokerEvent::new(
            id,
            EventKind::ObjectCreated {
                handle: ObjectHandle::new(1, 4),
                object_type: "Generic".into(),
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "object-created");
        assert_eq!(value["handle"], "1:4");
        assert_eq!(value["objectType"], "Generic");
        assert_eq!(value["contextId"], id.to_string());
        assert_eq!(event.name(), "object-created");
    }

    #[test]
    fn test_history_is_bounded() {
        let bus = EventBus::with_history(2);
        let id = Uuid::new_v4();
        bus.emit_for(id, EventKind::ContextCreated);
        bus.emit_for(id, EventKind::Connected { generation: 1 });
        bus.emit_for(id, EventKind::Disconnected);

        let history = bus.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].name(), "connected");
        assert_eq!(history[1].name(), "disconnected");
    }

    #[tokio::test]
    async fn test_subscribe_to_filters_by_name() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe_to(&["suspended"]);
        let id = Uuid::new_v4();

        bus.emit_for(id, EventKind::Connected { generation: 1 });
        bus.emit_for(
            id,
            EventKind::Suspended {
                terminal: false,
                reason: "socket closed".into(),
            },
        );

        let event = stream.next().await.unwrap();
        assert_eq!(event.name(), "suspended");
        assert_eq!(event.context_id, id);
    }

    #[tokio::test]
    async fn test_history_plus_stream_replays_then_follows() {
        let bus = EventBus::new();
        let id = Uuid::new_v4();
        bus.emit_for(id, EventKind::ContextCreated);

        let mut stream = bus.history_plus_stream();
        bus.emit_for(id, EventKind::ContextDeleted);

        assert_eq!(stream.next().await.unwrap().name(), "context-created");
        assert_eq!(stream.next().await.unwrap().name(), "context-deleted");
    }

    #[tokio::test]
    async fn test_subscribe_context_ignores_other_contexts() {
        let bus = EventBus::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut stream = bus.subscribe_context(b);

        bus.emit_for(a, EventKind::Disconnected);
        bus.emit_for(b, EventKind::ContextDeleted);

        let event = stream.next().await.unwrap();
        assert_eq!(event.context_id, b);
    }
}
