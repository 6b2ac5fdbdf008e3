//! Change poller
//!
//! Producer for stores without push notifications: periodically asks one
//! store what changed and emits a `Modified` event per native id.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::document::ItemKey;
use crate::error::{Result, SyncError};
use crate::events::{ChangeEvent, EventBus, EventKind};
use crate::store::StoreClient;

pub struct ChangePoller {
    bus: EventBus,
    client: Arc<dyn StoreClient>,
    interval: Duration,
    timeout: Duration,
    since: Mutex<DateTime<Utc>>,
}

impl ChangePoller {
    pub fn new(bus: EventBus, client: Arc<dyn StoreClient>, interval: Duration) -> Self {
        Self {
            bus,
            client,
            interval,
            timeout: Duration::from_secs(30),
            since: Mutex::new(Utc::now()),
        }
    }

    /// Report changes after `since` on the first poll instead of only new ones
    pub fn with_since(self, since: DateTime<Utc>) -> Self {
        *self.since.lock() = since;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Poll once; returns the number of events enqueued
    pub async fn poll_once(&self) -> Result<usize> {
        let since = *self.since.lock();
        let started = Utc::now();
        let store = self.client.store();

        let changed = tokio::time::timeout(self.timeout, self.client.list_changed_since(since))
            .await
            .map_err(|_| SyncError::Timeout {
                operation: "list_changed_since",
                millis: self.timeout.as_millis() as u64,
            })??;

        let mut enqueued = 0;
        for native_id in changed {
            let event = ChangeEvent::new(ItemKey::native(store, native_id), store, EventKind::Modified);
            if self.bus.emit(event).await.is_enqueued() {
                enqueued += 1;
            }
        }

        *self.since.lock() = started;
        if enqueued > 0 {
            tracing::debug!(store = %store, events = enqueued, "Polled store changes");
        }
        Ok(enqueued)
    }

    /// Poll every interval until the bus closes
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(store = %self.client.store(), interval_ms = self.interval.as_millis() as u64, "Change poller started");

            loop {
                ticker.tick().await;
                if self.bus.is_closed() {
                    break;
                }
                if let Err(e) = self.poll_once().await {
                    tracing::warn!(store = %self.client.store(), "Change poll failed: {}", e);
                }
            }

            tracing::info!(store = %self.client.store(), "Change poller stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::StoreId;
    use crate::events::EventType;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use serde_json::json;

    #[tokio::test]
    async fn test_poll_emits_modified_events() {
        let store = Arc::new(MemoryStore::new(StoreId::Local));
        store.insert("a.md", Utc.timestamp_opt(100, 0).unwrap(), json!({"title": "A"}));
        store.insert("b.md", Utc.timestamp_opt(200, 0).unwrap(), json!({"title": "B"}));
        let bus = EventBus::default();

        let poller = ChangePoller::new(bus.clone(), store.clone(), Duration::from_secs(60))
            .with_since(Utc.timestamp_opt(150, 0).unwrap());

        assert_eq!(poller.poll_once().await.unwrap(), 1);
        let event = bus.try_dequeue().unwrap();
        assert_eq!(event.item_key, ItemKey::native(StoreId::Local, "b.md"));
        assert_eq!(event.kind, EventKind::Modified);
        assert_eq!(event.event_type(), EventType::StoreChange);

        // Cursor advanced past the old items
        assert_eq!(poller.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spawned_poller_stops_when_bus_closes() {
        let store = Arc::new(MemoryStore::new(StoreId::Remote));
        let bus = EventBus::default();
        let handle = ChangePoller::new(bus.clone(), store, Duration::from_millis(5)).spawn();

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.close();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
