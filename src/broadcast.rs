//! Broadcast boundary
//!
//! Every mutation path publishes a change event so an unbounded number of
//! rendering consumers stay current. Publishing is one-way and
//! fire-and-forget: no acknowledgement, no delivery guarantee. The sink is
//! injected, so the engine is testable without a real transport.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::types::EntityId;

/// Which entity kind changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    DataTable,
    ApiEndpoint,
    Variable,
    Transformer,
}

/// One published change. `value` is the new state, or null on delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub id: EntityId,
    pub value: Value,
}

/// One-way publish port consumed by an external preview channel.
pub trait Broadcast: Send + Sync {
    fn publish(&self, event: ChangeEvent);
}

/// Sink that drops every event. The default when no preview is attached.
pub struct NullBroadcast;

impl Broadcast for NullBroadcast {
    fn publish(&self, _event: ChangeEvent) {}
}

/// Append-only sink that records events for assertions.
#[derive(Clone, Default)]
pub struct RecordingBroadcast {
    events: Arc<RwLock<Vec<ChangeEvent>>>,
}

impl RecordingBroadcast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events for one entity kind, in publish order.
    pub fn filter_kind(&self, kind: ChangeKind) -> Vec<ChangeEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Events for one entity id, in publish order.
    pub fn filter_id(&self, id: &str) -> Vec<ChangeEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.id == id)
            .cloned()
            .collect()
    }
}

impl Broadcast for RecordingBroadcast {
    fn publish(&self, event: ChangeEvent) {
        self.events.write().push(event);
    }
}
