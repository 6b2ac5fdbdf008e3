//! Event bus types

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::{ItemKey, StoreId};

/// Default priority for producer change notifications
pub const PRIORITY_CHANGE: i32 = 1;
/// Priority of successful sync notifications
pub const PRIORITY_SYNC_COMPLETE: i32 = 0;
/// Priority of failure and pending-decision notifications
pub const PRIORITY_SYNC_ERROR: i32 = 3;
/// Priority used when the engine re-enqueues an event after a lock timeout
pub const PRIORITY_LOWEST: i32 = i32::MIN;

/// What happened to the item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Modified,
    Deleted,
    Moved,
    /// Emitted by the coordinator after a task succeeded
    SyncCompleted,
    /// Emitted by the coordinator after a task failed
    SyncFailed,
    /// Emitted when a conflict needs a human decision
    DecisionRequired,
}

impl EventKind {
    pub fn event_type(self) -> EventType {
        match self {
            EventKind::Created | EventKind::Modified | EventKind::Deleted | EventKind::Moved => {
                EventType::StoreChange
            }
            EventKind::SyncCompleted => EventType::SyncComplete,
            EventKind::SyncFailed => EventType::SyncError,
            EventKind::DecisionRequired => EventType::DecisionRequired,
        }
    }
}

/// Handler registration key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StoreChange,
    SyncComplete,
    SyncError,
    DecisionRequired,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::StoreChange => "store_change",
            EventType::SyncComplete => "sync_complete",
            EventType::SyncError => "sync_error",
            EventType::DecisionRequired => "decision_required",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change notification. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: String,
    #[serde(rename = "itemKey")]
    pub item_key: ItemKey,
    /// Side that changed
    pub store: StoreId,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    /// Higher is more urgent
    pub priority: i32,
    /// Optional producer data for handlers and history. The sync engine
    /// ignores it and always refetches the item from its store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Times the engine has re-enqueued this notification
    #[serde(default)]
    pub redelivery: u32,
}

impl ChangeEvent {
    pub fn new(item_key: ItemKey, store: StoreId, kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            item_key,
            store,
            kind,
            timestamp: Utc::now(),
            priority: PRIORITY_CHANGE,
            payload: None,
            redelivery: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    /// A fresh copy scheduled once more at the lowest priority
    pub fn redelivered(&self) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            priority: PRIORITY_LOWEST,
            redelivery: self.redelivery + 1,
            ..self.clone()
        }
    }
}

/// Result of an emit call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitOutcome {
    Enqueued,
    /// Queue was full; the named event was dropped to make room
    EnqueuedAfterEviction { evicted: String },
    /// Queue was full and the incoming event had the lowest priority
    Rejected,
}

impl EmitOutcome {
    pub fn is_enqueued(&self) -> bool {
        !matches!(self, EmitOutcome::Rejected)
    }
}

/// Delivery summary for one dispatched event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Error a handler may return; logged, never propagated
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Registered handler identity, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) u64);

/// Event statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventStats {
    #[serde(rename = "totalEvents")]
    pub total_events: usize,
    #[serde(rename = "eventsByType")]
    pub events_by_type: BTreeMap<EventType, usize>,
    #[serde(rename = "eventsBySource")]
    pub events_by_source: BTreeMap<StoreId, usize>,
    #[serde(rename = "eventsByPriority")]
    pub events_by_priority: BTreeMap<i32, usize>,
    #[serde(rename = "queueDepth")]
    pub queue_depth: usize,
    #[serde(rename = "droppedUnhandled")]
    pub dropped_unhandled: u64,
    pub evicted: u64,
    pub rejected: u64,
    #[serde(rename = "handlerFailures")]
    pub handler_failures: u64,
    #[serde(rename = "recentEvents")]
    pub recent: Vec<ChangeEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_maps_to_type() {
        assert_eq!(EventKind::Moved.event_type(), EventType::StoreChange);
        assert_eq!(EventKind::SyncFailed.event_type(), EventType::SyncError);
        assert_eq!(
            EventKind::DecisionRequired.event_type(),
            EventType::DecisionRequired
        );
    }

    #[test]
    fn test_redelivered_copy() {
        let event = ChangeEvent::new(ItemKey::logical("doc-1"), StoreId::Remote, EventKind::Modified)
            .with_priority(5);
        let again = event.redelivered();

        assert_ne!(again.id, event.id);
        assert_eq!(again.priority, PRIORITY_LOWEST);
        assert_eq!(again.redelivery, 1);
        assert_eq!(again.item_key, event.item_key);
    }

    #[test]
    fn test_event_serialization() {
        let event = ChangeEvent::new(
            ItemKey::native(StoreId::Local, "notes/a.md"),
            StoreId::Local,
            EventKind::Created,
        );
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("itemKey").is_some());
        assert_eq!(json["kind"], "created");
        assert!(json.get("payload").is_none());
    }
}
