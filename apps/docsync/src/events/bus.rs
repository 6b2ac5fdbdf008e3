//! Bounded priority event bus
//!
//! Producers emit from any task or thread; the coordinator drains with
//! `dequeue`. Ordering is strict priority (higher first), FIFO within a
//! priority. Under sustained overload the oldest entry of the lowest
//! priority present is dropped instead of blocking the producer forever.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::types::{
    ChangeEvent, DispatchReport, EmitOutcome, EventStats, EventType, HandlerError, HandlerId,
};
use crate::config::EngineConfig;

/// Callback invoked for every dispatched event of a registered type
pub type EventHandler = Arc<dyn Fn(&ChangeEvent) -> Result<(), HandlerError> + Send + Sync>;

/// Number of events returned in `EventStats::recent`
const RECENT_EVENTS: usize = 10;

/// Bus sizing
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Maximum queued events
    pub capacity: usize,
    /// Maximum retained history entries
    pub history_capacity: usize,
    /// How long `emit` waits for room before applying the overload policy
    pub emit_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            history_capacity: 1000,
            emit_timeout: Duration::from_millis(250),
        }
    }
}

impl From<&EngineConfig> for BusConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            capacity: config.queue_capacity.max(1),
            history_capacity: config.history_capacity,
            emit_timeout: Duration::from_millis(config.emit_timeout_ms),
        }
    }
}

struct Queued {
    seq: u64,
    event: ChangeEvent,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: higher priority first, then lower sequence (earlier) first
    fn cmp(&self, other: &Self) -> Ordering {
        self.event
            .priority
            .cmp(&other.event.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
    closed: bool,
}

enum PushAttempt {
    Done(EmitOutcome),
    Full(ChangeEvent),
}

#[derive(Default)]
struct Counters {
    dropped_unhandled: AtomicU64,
    evicted: AtomicU64,
    rejected: AtomicU64,
    handler_failures: AtomicU64,
}

/// Thread-safe priority event bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    config: BusConfig,
    queue: Mutex<QueueState>,
    not_empty: Notify,
    not_full: Notify,
    handlers: RwLock<BTreeMap<EventType, Vec<(HandlerId, EventHandler)>>>,
    next_handler: AtomicU64,
    history: Mutex<VecDeque<ChangeEvent>>,
    counters: Counters,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                queue: Mutex::new(QueueState::default()),
                not_empty: Notify::new(),
                not_full: Notify::new(),
                handlers: RwLock::new(BTreeMap::new()),
                next_handler: AtomicU64::new(1),
                history: Mutex::new(VecDeque::new()),
                counters: Counters::default(),
            }),
        }
    }

    // ========================================================================
    // Producing
    // ========================================================================

    /// Enqueue an event, waiting up to the emit timeout for room
    pub async fn emit(&self, event: ChangeEvent) -> EmitOutcome {
        let deadline = Instant::now() + self.inner.config.emit_timeout;
        let mut event = event;

        loop {
            let notified = self.inner.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_push(event) {
                PushAttempt::Done(outcome) => return outcome,
                PushAttempt::Full(returned) => event = returned,
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        self.push_with_eviction(event)
    }

    /// Enqueue without waiting; applies the overload policy immediately
    pub fn try_emit(&self, event: ChangeEvent) -> EmitOutcome {
        match self.try_push(event) {
            PushAttempt::Done(outcome) => outcome,
            PushAttempt::Full(event) => self.push_with_eviction(event),
        }
    }

    fn try_push(&self, event: ChangeEvent) -> PushAttempt {
        let mut queue = self.inner.queue.lock();
        if queue.closed {
            drop(queue);
            return PushAttempt::Done(self.reject(&event, "bus closed"));
        }
        if queue.heap.len() >= self.inner.config.capacity {
            return PushAttempt::Full(event);
        }

        self.push_locked(&mut queue, event);
        PushAttempt::Done(EmitOutcome::Enqueued)
    }

    fn push_with_eviction(&self, event: ChangeEvent) -> EmitOutcome {
        let mut queue = self.inner.queue.lock();
        if queue.closed {
            drop(queue);
            return self.reject(&event, "bus closed");
        }
        if queue.heap.len() < self.inner.config.capacity {
            self.push_locked(&mut queue, event);
            return EmitOutcome::Enqueued;
        }

        let mut items = std::mem::take(&mut queue.heap).into_vec();
        let victim_index = items
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.event
                    .priority
                    .cmp(&b.event.priority)
                    .then_with(|| a.seq.cmp(&b.seq))
            })
            .map(|(index, _)| index);

        let victim_index = match victim_index {
            Some(index) if items[index].event.priority <= event.priority => index,
            _ => {
                queue.heap = BinaryHeap::from(items);
                drop(queue);
                return self.reject(&event, "queue full of higher-priority events");
            }
        };

        let victim = items.swap_remove(victim_index);
        queue.heap = BinaryHeap::from(items);
        self.push_locked(&mut queue, event);
        drop(queue);

        self.inner.counters.evicted.fetch_add(1, AtomicOrdering::Relaxed);
        tracing::warn!(
            evicted = %victim.event.id,
            priority = victim.event.priority,
            "Event queue overloaded, dropped oldest low-priority event"
        );

        EmitOutcome::EnqueuedAfterEviction {
            evicted: victim.event.id,
        }
    }

    fn push_locked(&self, queue: &mut QueueState, event: ChangeEvent) {
        let seq = queue.next_seq;
        queue.next_seq += 1;

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type(),
            item = %event.item_key,
            priority = event.priority,
            "Event emitted"
        );

        self.record_history(event.clone());
        queue.heap.push(Queued { seq, event });
        self.inner.not_empty.notify_one();
    }

    fn reject(&self, event: &ChangeEvent, why: &str) -> EmitOutcome {
        self.inner.counters.rejected.fetch_add(1, AtomicOrdering::Relaxed);
        tracing::warn!(event_id = %event.id, item = %event.item_key, "Event rejected: {}", why);
        EmitOutcome::Rejected
    }

    fn record_history(&self, event: ChangeEvent) {
        let capacity = self.inner.config.history_capacity;
        if capacity == 0 {
            return;
        }
        let mut history = self.inner.history.lock();
        while history.len() >= capacity {
            history.pop_front();
        }
        history.push_back(event);
    }

    // ========================================================================
    // Consuming
    // ========================================================================

    /// Next event by priority, waiting while the queue is empty.
    ///
    /// Returns `None` once the bus is closed and drained.
    pub async fn dequeue(&self) -> Option<ChangeEvent> {
        loop {
            let notified = self.inner.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut queue = self.inner.queue.lock();
                if let Some(item) = queue.heap.pop() {
                    drop(queue);
                    self.inner.not_full.notify_one();
                    return Some(item.event);
                }
                if queue.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Next event if one is queued
    pub fn try_dequeue(&self) -> Option<ChangeEvent> {
        let item = self.inner.queue.lock().heap.pop();
        if item.is_some() {
            self.inner.not_full.notify_one();
        }
        item.map(|queued| queued.event)
    }

    /// Deliver an event to its handlers in registration order
    pub fn dispatch(&self, event: &ChangeEvent) -> DispatchReport {
        let event_type = event.event_type();
        let handlers: Vec<(HandlerId, EventHandler)> = self
            .inner
            .handlers
            .read()
            .get(&event_type)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            self.inner
                .counters
                .dropped_unhandled
                .fetch_add(1, AtomicOrdering::Relaxed);
            tracing::warn!(
                event_id = %event.id,
                event_type = %event_type,
                "No handlers registered for event type, dropping event"
            );
            return DispatchReport::default();
        }

        let mut report = DispatchReport::default();
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::error!(handler = id.0, event_id = %event.id, "Event handler error: {}", e);
                }
                Err(_) => {
                    report.failed += 1;
                    tracing::error!(handler = id.0, event_id = %event.id, "Event handler panicked");
                }
            }
        }

        if report.failed > 0 {
            self.inner
                .counters
                .handler_failures
                .fetch_add(report.failed as u64, AtomicOrdering::Relaxed);
        }
        report
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    /// Register a handler; handlers of one type run in registration order
    pub fn register_handler<F>(&self, event_type: EventType, handler: F) -> HandlerId
    where
        F: Fn(&ChangeEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, AtomicOrdering::Relaxed));
        self.inner
            .handlers
            .write()
            .entry(event_type)
            .or_default()
            .push((id, Arc::new(handler)));

        tracing::info!(event_type = %event_type, handler = id.0, "Registered event handler");
        id
    }

    /// Remove a handler; returns whether it was registered
    pub fn unregister_handler(&self, event_type: EventType, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.write();
        let Some(list) = handlers.get_mut(&event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|(handler_id, _)| *handler_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&event_type);
        }
        if removed {
            tracing::info!(event_type = %event_type, handler = id.0, "Unregistered event handler");
        }
        removed
    }

    // ========================================================================
    // Lifecycle & observability
    // ========================================================================

    /// Stop accepting events; queued events can still be drained
    pub fn close(&self) {
        self.inner.queue.lock().closed = true;
        self.inner.not_empty.notify_waiters();
        self.inner.not_full.notify_waiters();
        tracing::info!("Event bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.queue.lock().closed
    }

    /// Queue depth
    pub fn len(&self) -> usize {
        self.inner.queue.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recent events, newest last, optionally filtered by type
    pub fn history(&self, event_type: Option<EventType>, limit: usize) -> Vec<ChangeEvent> {
        let history = self.inner.history.lock();
        let filtered: Vec<&ChangeEvent> = history
            .iter()
            .filter(|e| event_type.map_or(true, |t| e.event_type() == t))
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).cloned().collect()
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
        tracing::info!("Event history cleared");
    }

    pub fn stats(&self) -> EventStats {
        let mut stats = EventStats {
            queue_depth: self.len(),
            dropped_unhandled: self.inner.counters.dropped_unhandled.load(AtomicOrdering::Relaxed),
            evicted: self.inner.counters.evicted.load(AtomicOrdering::Relaxed),
            rejected: self.inner.counters.rejected.load(AtomicOrdering::Relaxed),
            handler_failures: self.inner.counters.handler_failures.load(AtomicOrdering::Relaxed),
            ..Default::default()
        };

        let history = self.inner.history.lock();
        stats.total_events = history.len();
        for event in history.iter() {
            *stats.events_by_type.entry(event.event_type()).or_default() += 1;
            *stats.events_by_source.entry(event.store).or_default() += 1;
            *stats.events_by_priority.entry(event.priority).or_default() += 1;
        }
        let skip = history.len().saturating_sub(RECENT_EVENTS);
        stats.recent = history.iter().skip(skip).cloned().collect();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ItemKey, StoreId};
    use crate::events::types::{EventKind, PRIORITY_LOWEST};
    use std::sync::atomic::AtomicUsize;

    fn change(item: &str, priority: i32) -> ChangeEvent {
        ChangeEvent::new(ItemKey::logical(item), StoreId::Remote, EventKind::Modified)
            .with_priority(priority)
    }

    fn small_bus(capacity: usize) -> EventBus {
        EventBus::new(BusConfig {
            capacity,
            history_capacity: 100,
            emit_timeout: Duration::from_millis(20),
        })
    }

    #[tokio::test]
    async fn test_strict_priority_order() {
        let bus = EventBus::default();
        for (item, priority) in [("p1", 1), ("p3", 3), ("p2", 2)] {
            assert_eq!(bus.emit(change(item, priority)).await, EmitOutcome::Enqueued);
        }

        let order: Vec<i32> = vec![
            bus.dequeue().await.unwrap().priority,
            bus.dequeue().await.unwrap().priority,
            bus.dequeue().await.unwrap().priority,
        ];
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let bus = EventBus::default();
        let ids: Vec<String> = (0..5)
            .map(|i| {
                let event = change(&format!("doc-{}", i), 1);
                let id = event.id.clone();
                bus.try_emit(event);
                id
            })
            .collect();

        let mut dequeued = Vec::new();
        while let Some(event) = bus.try_dequeue() {
            dequeued.push(event.id);
        }
        assert_eq!(dequeued, ids);
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_emit() {
        let bus = EventBus::default();
        let consumer = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.emit(change("doc-1", 1)).await;

        let event = consumer.await.unwrap().unwrap();
        assert_eq!(event.item_key, ItemKey::logical("doc-1"));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let bus = EventBus::default();
        bus.try_emit(change("doc-1", 1));
        bus.close();

        assert_eq!(bus.try_emit(change("doc-2", 1)), EmitOutcome::Rejected);
        assert!(bus.dequeue().await.is_some());
        assert!(bus.dequeue().await.is_none());
    }

    #[test]
    fn test_unhandled_event_is_dropped_and_counted() {
        let bus = EventBus::default();
        let event = change("doc-1", 1);

        let report = bus.dispatch(&event);

        assert_eq!(report, DispatchReport::default());
        assert_eq!(bus.stats().dropped_unhandled, 1);
    }

    #[test]
    fn test_handler_failure_does_not_stop_delivery() {
        let bus = EventBus::default();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let first = calls.clone();
        bus.register_handler(EventType::StoreChange, move |_| {
            first.lock().push("first");
            Err(HandlerError::new("boom"))
        });
        bus.register_handler(EventType::StoreChange, |_| panic!("handler bug"));
        let third = calls.clone();
        bus.register_handler(EventType::StoreChange, move |_| {
            third.lock().push("third");
            Ok(())
        });

        let report = bus.dispatch(&change("doc-1", 1));

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(*calls.lock(), vec!["first", "third"]);
        assert_eq!(bus.stats().handler_failures, 2);
    }

    #[test]
    fn test_unregister_handler() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let id = bus.register_handler(EventType::SyncComplete, move |_| {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        });

        let done = ChangeEvent::new(ItemKey::logical("doc-1"), StoreId::Local, EventKind::SyncCompleted);
        bus.dispatch(&done);
        assert!(bus.unregister_handler(EventType::SyncComplete, id));
        assert!(!bus.unregister_handler(EventType::SyncComplete, id));
        bus.dispatch(&done);

        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(bus.stats().dropped_unhandled, 1);
    }

    #[test]
    fn test_overload_evicts_oldest_lowest_priority() {
        let bus = small_bus(3);
        let oldest_low = change("low-1", 0);
        let oldest_low_id = oldest_low.id.clone();
        bus.try_emit(oldest_low);
        bus.try_emit(change("low-2", 0));
        bus.try_emit(change("high", 5));

        let outcome = bus.try_emit(change("mid", 2));

        assert_eq!(
            outcome,
            EmitOutcome::EnqueuedAfterEviction {
                evicted: oldest_low_id
            }
        );
        assert_eq!(bus.len(), 3);
        assert_eq!(bus.try_dequeue().unwrap().priority, 5);
        assert_eq!(bus.try_dequeue().unwrap().priority, 2);
        assert_eq!(bus.try_dequeue().unwrap().item_key, ItemKey::logical("low-2"));
        assert_eq!(bus.stats().evicted, 1);
    }

    #[test]
    fn test_overload_rejects_lowest_incoming() {
        let bus = small_bus(2);
        bus.try_emit(change("a", 3));
        bus.try_emit(change("b", 3));

        assert_eq!(bus.try_emit(change("c", PRIORITY_LOWEST)), EmitOutcome::Rejected);
        assert_eq!(bus.len(), 2);
        assert_eq!(bus.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_emit_waits_for_room_before_evicting() {
        let bus = EventBus::new(BusConfig {
            capacity: 1,
            history_capacity: 10,
            emit_timeout: Duration::from_millis(500),
        });
        bus.try_emit(change("first", 1));

        let consumer = {
            let bus = bus.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                bus.try_dequeue()
            })
        };

        let outcome = bus.emit(change("second", 1)).await;
        assert_eq!(outcome, EmitOutcome::Enqueued);
        assert!(consumer.await.unwrap().is_some());
        assert_eq!(bus.stats().evicted, 0);
    }

    #[tokio::test]
    async fn test_concurrent_emitters() {
        let bus = EventBus::default();
        let mut tasks = Vec::new();
        for worker in 0..8 {
            let bus = bus.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..25 {
                    bus.emit(change(&format!("w{}-{}", worker, i), i % 3)).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(bus.len(), 200);
        let mut last = i32::MAX;
        while let Some(event) = bus.try_dequeue() {
            assert!(event.priority <= last);
            last = event.priority;
        }
    }

    #[test]
    fn test_history_is_bounded_and_filterable() {
        let bus = EventBus::new(BusConfig {
            capacity: 100,
            history_capacity: 3,
            emit_timeout: Duration::from_millis(10),
        });
        for i in 0..5 {
            bus.try_emit(change(&format!("doc-{}", i), 1));
        }
        bus.try_emit(ChangeEvent::new(
            ItemKey::logical("doc-9"),
            StoreId::Local,
            EventKind::SyncFailed,
        ));

        let all = bus.history(None, 100);
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].kind, EventKind::SyncFailed);

        let errors = bus.history(Some(EventType::SyncError), 10);
        assert_eq!(errors.len(), 1);

        let stats = bus.stats();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.events_by_type[&EventType::StoreChange], 2);
        assert_eq!(stats.events_by_source[&StoreId::Local], 1);
        assert_eq!(stats.queue_depth, 6);

        bus.clear_history();
        assert!(bus.history(None, 10).is_empty());
    }
}
