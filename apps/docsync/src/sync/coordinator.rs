//! Sync coordinator
//!
//! Turns change events and manual requests into completed sync actions.
//!
//! - At most one task runs per logical item (per-item lock table)
//! - An event for a busy item waits in a single pending slot, newest wins
//! - Task executions across items are bounded by a semaphore
//! - Every store and converter call is wrapped in a timeout; transient
//!   failures are retried with exponential backoff
//!
//! The coordinator is the only component that writes to either store.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;

use super::ledger::SyncLedger;
use super::locks::ItemLocks;
use super::types::{
    Direction, PendingDecision, SyncOutcome, SyncStatus, SyncTask, SyncTaskHandle, TaskPhase,
    TaskRecord, TaskStatus,
};
use crate::config::{Config, EngineConfig};
use crate::conflict::{Conflict, ConflictResolver, ConflictStats, Resolution, ResolutionStrategy};
use crate::document::{CanonicalDocument, ItemKey, StoreId};
use crate::error::{FailureReason, Result, SyncError};
use crate::events::{
    BusConfig, ChangeEvent, EmitOutcome, EventBus, EventKind, EventStats, EventType,
    HandlerError, HandlerId, PRIORITY_SYNC_COMPLETE, PRIORITY_SYNC_ERROR,
};
use crate::store::{NativeItem, StorePair};

/// One side as fetched at the start of an attempt
struct Snapshot {
    store: StoreId,
    modified_at: DateTime<Utc>,
    doc: CanonicalDocument,
}

/// Writes prepared by an attempt. A retry finishes the pending writes
/// instead of resolving again, so a partly applied result is never
/// resolved a second time.
struct ApplyPlan {
    outcome: SyncOutcome,
    resolved_at: DateTime<Utc>,
    timestamps: BTreeMap<StoreId, DateTime<Utc>>,
    deferred: bool,
    pending: VecDeque<(StoreId, Option<String>, NativeItem)>,
    written: Vec<StoreId>,
}

struct Dispatcher {
    handlers: Vec<(EventType, HandlerId)>,
    task: JoinHandle<()>,
}

/// Sync coordinator
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    config: EngineConfig,
    bus: EventBus,
    stores: StorePair,
    resolver: ConflictResolver,
    ledger: SyncLedger,
    locks: ItemLocks,
    /// Bounds concurrent task executions
    permits: Semaphore,
    /// Items with a running event task, and their coalesced pending event
    slots: Mutex<HashMap<String, Option<ChangeEvent>>>,
    decisions: Mutex<BTreeMap<String, PendingDecision>>,
    failures: Mutex<VecDeque<TaskRecord>>,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    success_count: AtomicU64,
    error_count: AtomicU64,
    executing: AtomicUsize,
    /// Spawned task futures still alive
    active: AtomicUsize,
    idle: Notify,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl SyncCoordinator {
    pub fn new(config: EngineConfig, bus: EventBus, stores: StorePair) -> Self {
        let resolver =
            ConflictResolver::new(config.default_strategy, config.conflict_history_capacity);
        let permits = Semaphore::new(config.max_concurrent_tasks.max(1));

        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                bus,
                stores,
                resolver,
                ledger: SyncLedger::new(),
                locks: ItemLocks::new(),
                permits,
                slots: Mutex::new(HashMap::new()),
                decisions: Mutex::new(BTreeMap::new()),
                failures: Mutex::new(VecDeque::new()),
                last_sync: Mutex::new(None),
                success_count: AtomicU64::new(0),
                error_count: AtomicU64::new(0),
                executing: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                idle: Notify::new(),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Build a coordinator and its own bus from loaded configuration
    pub fn from_config(config: &Config, stores: StorePair) -> Self {
        let bus = EventBus::new(BusConfig::from(&config.engine));
        Self::new(config.engine.clone(), bus, stores)
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn ledger(&self) -> &SyncLedger {
        &self.inner.ledger
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.inner.resolver
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Register for store changes and start the dispatch loop
    pub fn start(&self) -> Result<()> {
        if self.inner.bus.is_closed() {
            return Err(SyncError::BusClosed);
        }

        let mut dispatcher = self.inner.dispatcher.lock();
        if dispatcher.is_some() {
            tracing::warn!("Sync coordinator already started");
            return Ok(());
        }

        let weak = Arc::downgrade(&self.inner);
        let mut handlers = vec![(
            EventType::StoreChange,
            self.inner
                .bus
                .register_handler(EventType::StoreChange, move |event| {
                    let inner = weak
                        .upgrade()
                        .ok_or_else(|| HandlerError::new("sync coordinator dropped"))?;
                    inner.schedule(event.clone());
                    Ok(())
                }),
        )];

        // Outcome events are consumed here so they are never dropped as
        // unhandled; hosts register their own handlers alongside.
        for event_type in [
            EventType::SyncComplete,
            EventType::SyncError,
            EventType::DecisionRequired,
        ] {
            let id = self.inner.bus.register_handler(event_type, |event| {
                tracing::debug!(
                    event_id = %event.id,
                    item = %event.item_key,
                    kind = ?event.kind,
                    "Sync outcome delivered"
                );
                Ok(())
            });
            handlers.push((event_type, id));
        }

        let bus = self.inner.bus.clone();
        let task = tokio::spawn(async move {
            tracing::info!("Sync dispatch loop started");
            while let Some(event) = bus.dequeue().await {
                bus.dispatch(&event);
            }
            tracing::info!("Sync dispatch loop stopped");
        });

        *dispatcher = Some(Dispatcher { handlers, task });

        tracing::info!(
            max_concurrent = self.inner.config.max_concurrent_tasks,
            max_attempts = self.inner.config.max_attempts,
            strategy = %self.inner.config.default_strategy,
            "Sync coordinator started"
        );
        Ok(())
    }

    /// Close the bus, drain queued events and wait for running tasks
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down sync coordinator");
        self.inner.bus.close();

        let dispatcher = self.inner.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.task.await {
                tracing::error!("Dispatch loop ended abnormally: {}", e);
            }
            for (event_type, id) in dispatcher.handlers {
                self.inner.bus.unregister_handler(event_type, id);
            }
        }

        self.inner.wait_idle().await;
        tracing::info!("Sync coordinator stopped");
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Convenience for producers holding the coordinator
    pub async fn emit(&self, event: ChangeEvent) -> EmitOutcome {
        self.inner.bus.emit(event).await
    }

    /// Sync one item now, bypassing the bus.
    ///
    /// Cancels a pending coalesced event for the item; never interrupts a
    /// running task. Must be called from within a Tokio runtime.
    pub fn trigger_manual_sync(&self, direction: Direction, item_key: ItemKey) -> SyncTaskHandle {
        self.trigger_manual_sync_with(direction, item_key, None)
    }

    /// Manual sync with a strategy applied to every conflicting field
    pub fn trigger_manual_sync_with(
        &self,
        direction: Direction,
        item_key: ItemKey,
        strategy: Option<ResolutionStrategy>,
    ) -> SyncTaskHandle {
        let task = SyncTask::new(item_key, direction).with_strategy(strategy);
        let (tx, rx) = watch::channel(TaskStatus::Pending);
        let handle = SyncTaskHandle::new(&task, rx);

        self.inner.cancel_pending(&task.item_key);

        tracing::info!(
            task_id = %task.id,
            item = %task.item_key,
            direction = %direction,
            strategy = ?strategy,
            "Manual sync triggered"
        );

        let inner = self.inner.clone();
        self.inner.spawn_tracked(async move {
            inner.run_task(task, &tx, None).await;
        });
        handle
    }

    /// Sync every item changed on either store since the last successful
    /// bulk sync. Returns the final status of each task.
    pub async fn sync_all(&self, direction: Direction) -> Result<Vec<TaskStatus>> {
        let since = self
            .inner
            .ledger
            .last_bulk_sync()
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let started = Utc::now();

        let mut seen = HashSet::new();
        let mut handles = Vec::new();
        for store in StoreId::ALL {
            let client = &self.inner.stores.get(store).client;
            let changed = self
                .inner
                .io("list_changed_since", client.list_changed_since(since))
                .await?;

            for native_id in changed {
                let key = ItemKey::native(store, native_id);
                if seen.insert(self.inner.dispatch_key(&key)) {
                    handles.push(self.trigger_manual_sync(direction, key));
                }
            }
        }

        tracing::info!(items = handles.len(), direction = %direction, "Bulk sync started");

        let statuses: Vec<TaskStatus> = join_all(handles.into_iter().map(SyncTaskHandle::wait)).await;
        let failed = statuses.iter().filter(|s| !s.is_success()).count();
        if failed == 0 {
            self.inner.ledger.set_last_bulk_sync(started);
        }

        tracing::info!(
            succeeded = statuses.len() - failed,
            failed,
            "Bulk sync finished"
        );
        Ok(statuses)
    }

    // ========================================================================
    // Observability
    // ========================================================================

    pub fn get_sync_status(&self) -> SyncStatus {
        let inner = &self.inner;
        let coalesced = inner.slots.lock().values().filter(|slot| slot.is_some()).count();

        SyncStatus {
            success_count: inner.success_count.load(Ordering::SeqCst),
            pending_count: inner.bus.len() + coalesced,
            error_count: inner.error_count.load(Ordering::SeqCst),
            last_sync_time: *inner.last_sync.lock(),
            in_progress: inner.executing.load(Ordering::SeqCst),
            pending_decisions: inner.decisions.lock().len(),
            recent_failures: inner.failures.lock().iter().cloned().collect(),
        }
    }

    pub fn get_conflict_stats(&self) -> ConflictStats {
        self.inner.resolver.stats()
    }

    pub fn get_event_stats(&self) -> EventStats {
        self.inner.bus.stats()
    }

    /// Items waiting for a human decision
    pub fn pending_decisions(&self) -> Vec<PendingDecision> {
        self.inner.decisions.lock().values().cloned().collect()
    }

    pub fn pending_decision(&self, item_id: &str) -> Option<PendingDecision> {
        self.inner.decisions.lock().get(item_id).cloned()
    }
}

/// Decrements the live task count when a spawned task ends
struct ActiveTask(Arc<CoordinatorInner>);

impl Drop for ActiveTask {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl CoordinatorInner {
    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Key that groups events for the same item
    fn dispatch_key(&self, key: &ItemKey) -> String {
        self.ledger.resolve(key).unwrap_or_else(|| key.to_string())
    }

    fn schedule(self: &Arc<Self>, event: ChangeEvent) {
        let key = self.dispatch_key(&event.item_key);
        {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(&key) {
                match slot.replace(event) {
                    Some(replaced) => tracing::debug!(
                        item = %key,
                        replaced = %replaced.id,
                        "Coalesced pending event"
                    ),
                    None => tracing::debug!(item = %key, "Item busy, holding event"),
                }
                return;
            }
            slots.insert(key.clone(), None);
        }

        let inner = self.clone();
        self.spawn_tracked(async move {
            inner.drain_item(key, event).await;
        });
    }

    /// Run the event, then whatever was coalesced behind it
    async fn drain_item(self: Arc<Self>, key: String, first: ChangeEvent) {
        let mut next = Some(first);
        while let Some(event) = next.take() {
            let task = SyncTask::from_event(&event);
            let (tx, _rx) = watch::channel(TaskStatus::Pending);
            self.run_task(task, &tx, Some(&event)).await;
            next = self.next_pending(&key);
        }
    }

    fn next_pending(&self, key: &str) -> Option<ChangeEvent> {
        let mut slots = self.slots.lock();
        let pending = slots.get_mut(key).and_then(Option::take);
        if pending.is_none() {
            slots.remove(key);
        }
        pending
    }

    fn cancel_pending(&self, key: &ItemKey) {
        let key = self.dispatch_key(key);
        let cancelled = self.slots.lock().get_mut(&key).and_then(Option::take);
        if let Some(event) = cancelled {
            tracing::debug!(item = %key, event_id = %event.id, "Manual sync cancelled pending event");
        }
    }

    fn spawn_tracked<F>(self: &Arc<Self>, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveTask(self.clone());
        tokio::spawn(async move {
            let _guard = guard;
            fut.await;
        });
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    // ========================================================================
    // Task execution
    // ========================================================================

    async fn run_task(
        &self,
        mut task: SyncTask,
        status: &watch::Sender<TaskStatus>,
        event: Option<&ChangeEvent>,
    ) -> TaskStatus {
        self.executing.fetch_add(1, Ordering::SeqCst);

        let max_attempts = self.config.max_attempts.max(1);
        let mut plan = None;
        let result = loop {
            task.attempt += 1;
            match self.attempt(&mut task, status, &mut plan).await {
                Ok(outcome) => break Ok(outcome),
                Err(err) if err.is_retryable() && task.attempt < max_attempts => {
                    let delay = self.backoff(task.attempt);
                    tracing::warn!(
                        task_id = %task.id,
                        item = %task.item_key,
                        attempt = task.attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient sync failure, retrying: {}",
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => break Err(err),
            }
        };

        let final_status = match result {
            Ok(outcome) => self.finish_success(&task, outcome).await,
            Err(err) => self.finish_failure(&mut task, err, event).await,
        };

        self.executing.fetch_sub(1, Ordering::SeqCst);
        status.send_replace(final_status.clone());
        final_status
    }

    /// One attempt: identify, lock, fetch, classify, resolve, apply.
    ///
    /// The execution permit is taken only once the item lock is held, so
    /// a task waiting on a busy item never holds back other items.
    async fn attempt(
        &self,
        task: &mut SyncTask,
        status: &watch::Sender<TaskStatus>,
        plan: &mut Option<ApplyPlan>,
    ) -> Result<SyncOutcome> {
        advance(task, status, TaskPhase::Fetching)?;

        let logical_id = self.resolve_identity(&task.item_key).await?;
        task.logical_id = Some(logical_id.clone());

        let _guard = self
            .locks
            .acquire(&logical_id, Duration::from_millis(self.config.lock_timeout_ms))
            .await?;
        let _permit = self.permits.acquire().await.ok();

        if let Some(unfinished) = plan.take() {
            advance(task, status, TaskPhase::Applying)?;
            tracing::debug!(
                item = %logical_id,
                pending = unfinished.pending.len(),
                "Resuming unfinished writes"
            );
            return self.execute(task, status, &logical_id, unfinished, plan).await;
        }

        let (remote, local) = tokio::try_join!(
            self.fetch_side(StoreId::Remote, &logical_id),
            self.fetch_side(StoreId::Local, &logical_id),
        )?;

        match (remote, local) {
            (Some(remote), Some(local)) => {
                self.sync_both(task, status, &logical_id, remote, local, plan)
                    .await
            }
            (Some(present), None) => {
                self.sync_one_side(task, status, &logical_id, present, StoreId::Local, plan)
                    .await
            }
            (None, Some(present)) => {
                self.sync_one_side(task, status, &logical_id, present, StoreId::Remote, plan)
                    .await
            }
            (None, None) => {
                let recorded = self
                    .ledger
                    .entry(&logical_id)
                    .map_or(false, |entry| !entry.source_timestamps.is_empty());
                if !recorded {
                    return Err(SyncError::ItemNotFound(logical_id));
                }
                advance(task, status, TaskPhase::Done)?;
                Ok(SyncOutcome::SourceMissing {
                    store: task.source_store(),
                })
            }
        }
    }

    async fn sync_both(
        &self,
        task: &mut SyncTask,
        status: &watch::Sender<TaskStatus>,
        logical_id: &str,
        remote: Snapshot,
        local: Snapshot,
        plan: &mut Option<ApplyPlan>,
    ) -> Result<SyncOutcome> {
        let remote_changed = self
            .ledger
            .is_changed(logical_id, StoreId::Remote, remote.modified_at);
        let local_changed = self
            .ledger
            .is_changed(logical_id, StoreId::Local, local.modified_at);

        if !remote_changed && !local_changed {
            advance(task, status, TaskPhase::Done)?;
            tracing::debug!(item = %logical_id, "Both sides unchanged");
            return Ok(SyncOutcome::NoOp);
        }

        advance(task, status, TaskPhase::Resolving)?;

        if remote.doc.content_eq(&local.doc) {
            let fetched: BTreeMap<StoreId, DateTime<Utc>> = [
                (StoreId::Remote, remote.modified_at),
                (StoreId::Local, local.modified_at),
            ]
            .into_iter()
            .collect();
            self.ledger.record_sync(logical_id, &fetched);
            advance(task, status, TaskPhase::Done)?;
            return Ok(SyncOutcome::InSync);
        }

        if remote_changed != local_changed {
            let winner = if remote_changed { &remote } else { &local };
            let from = winner.store;
            let resolved = winner.doc.clone();
            let outcome = SyncOutcome::Propagated {
                from,
                written: Vec::new(),
            };
            return self
                .apply(task, status, logical_id, resolved, &[&remote, &local], outcome, plan)
                .await;
        }

        let (resolved, conflicts) = self.resolve_conflicts(task, logical_id, &remote.doc, &local.doc)?;
        let outcome = SyncOutcome::Resolved {
            conflicts,
            written: Vec::new(),
        };
        self.apply(task, status, logical_id, resolved, &[&remote, &local], outcome, plan)
            .await
    }

    async fn sync_one_side(
        &self,
        task: &mut SyncTask,
        status: &watch::Sender<TaskStatus>,
        logical_id: &str,
        present: Snapshot,
        missing: StoreId,
        plan: &mut Option<ApplyPlan>,
    ) -> Result<SyncOutcome> {
        if self.ledger.recorded_at(logical_id, missing).is_some() {
            tracing::info!(item = %logical_id, store = %missing, "Item deleted, not resurrecting");
            advance(task, status, TaskPhase::Done)?;
            return Ok(SyncOutcome::SourceMissing { store: missing });
        }

        advance(task, status, TaskPhase::Resolving)?;
        let outcome = SyncOutcome::Propagated {
            from: present.store,
            written: Vec::new(),
        };
        let resolved = present.doc.clone();
        self.apply(task, status, logical_id, resolved, &[&present], outcome, plan)
            .await
    }

    /// Detect and resolve; fails with `ConflictUnresolved` when any field
    /// needs a human decision
    fn resolve_conflicts(
        &self,
        task: &SyncTask,
        logical_id: &str,
        remote: &CanonicalDocument,
        local: &CanonicalDocument,
    ) -> Result<(CanonicalDocument, usize)> {
        let conflicts = self.resolver.detect(remote, local);
        let resolved = self.resolver.resolve_all(&conflicts, task.strategy);
        let count = resolved.len();

        if resolved.iter().any(|(_, r)| r.requires_manual_input) {
            let (conflicts, resolutions): (Vec<Conflict>, Vec<Resolution>) =
                resolved.into_iter().unzip();
            self.decisions.lock().insert(
                logical_id.to_string(),
                PendingDecision {
                    item_id: logical_id.to_string(),
                    task_id: task.id.clone(),
                    conflicts,
                    resolutions,
                    created_at: Utc::now(),
                },
            );
            return Err(SyncError::ConflictUnresolved {
                item: logical_id.to_string(),
                conflicts: count,
            });
        }

        let mut doc = remote.clone();
        for (_, resolution) in resolved {
            if let Some(value) = resolution.resolved_value {
                value.apply_to(&mut doc);
            }
        }
        Ok((doc, count))
    }

    /// Write the resolved document to every stale side the direction allows.
    ///
    /// Written sides record the resolved instant (the later snapshot) and
    /// untouched sides record their fetched instant. If a stale side may
    /// not be written, nothing is recorded so a later sync revisits the item.
    #[allow(clippy::too_many_arguments)]
    async fn apply(
        &self,
        task: &mut SyncTask,
        status: &watch::Sender<TaskStatus>,
        logical_id: &str,
        resolved: CanonicalDocument,
        snapshots: &[&Snapshot],
        outcome: SyncOutcome,
        plan: &mut Option<ApplyPlan>,
    ) -> Result<SyncOutcome> {
        let resolved_at = snapshots
            .iter()
            .map(|s| s.modified_at)
            .max()
            .unwrap_or_else(Utc::now);

        let mut timestamps = BTreeMap::new();
        let mut targets = Vec::new();
        let mut deferred = false;
        for store in StoreId::ALL {
            let snapshot = snapshots.iter().find(|s| s.store == store);
            let stale = snapshot.map_or(true, |s| !s.doc.content_eq(&resolved));
            if !stale {
                if let Some(s) = snapshot {
                    timestamps.insert(store, s.modified_at);
                }
            } else if task.direction.allows_write(store) {
                targets.push(store);
            } else {
                deferred = true;
                tracing::debug!(item = %logical_id, store = %store, direction = %task.direction, "Stale side not writable");
            }
        }

        if targets.is_empty() {
            if !deferred {
                self.ledger.record_sync(logical_id, &timestamps);
            }
            advance(task, status, TaskPhase::Done)?;
            return Ok(outcome);
        }

        advance(task, status, TaskPhase::Applying)?;

        // Convert everything before the first write
        let mut pending = VecDeque::with_capacity(targets.len());
        for store in targets {
            let endpoint = self.stores.get(store);
            let existing = self.ledger.native_id(logical_id, store);

            let mut doc = resolved.clone();
            doc.id = logical_id.to_string();
            doc.store_refs = self
                .ledger
                .entry(logical_id)
                .map(|entry| entry.store_refs)
                .unwrap_or_default();
            doc.source_timestamps = [(store, resolved_at)].into_iter().collect();

            let mut native = self
                .io("from_canonical", endpoint.converter.from_canonical(&doc))
                .await?;
            native.native_id = existing.clone().unwrap_or_default();
            native.modified_at = resolved_at;
            pending.push_back((store, existing, native));
        }

        let prepared = ApplyPlan {
            outcome,
            resolved_at,
            timestamps,
            deferred,
            pending,
            written: Vec::new(),
        };
        self.execute(task, status, logical_id, prepared, plan).await
    }

    /// Perform the planned writes in order. On failure the unwritten rest
    /// is parked in `slot` for the next attempt.
    async fn execute(
        &self,
        task: &mut SyncTask,
        status: &watch::Sender<TaskStatus>,
        logical_id: &str,
        mut prepared: ApplyPlan,
        slot: &mut Option<ApplyPlan>,
    ) -> Result<SyncOutcome> {
        while let Some((store, existing, native)) = prepared.pending.pop_front() {
            let client = &self.stores.get(store).client;
            let result = self
                .io("write_item", client.write_item(existing.as_deref(), native.clone()))
                .await;
            let native_id = match result {
                Ok(native_id) => native_id,
                Err(err) => {
                    prepared.pending.push_front((store, existing, native));
                    *slot = Some(prepared);
                    return Err(err);
                }
            };

            self.ledger.bind(logical_id, store, &native_id)?;
            prepared.timestamps.insert(store, prepared.resolved_at);
            prepared.written.push(store);

            tracing::debug!(item = %logical_id, store = %store, native_id = %native_id, "Applied resolved document");
        }

        if !prepared.deferred {
            self.ledger.record_sync(logical_id, &prepared.timestamps);
        }
        advance(task, status, TaskPhase::Done)?;
        Ok(prepared.outcome.with_written(prepared.written))
    }

    // ========================================================================
    // Store access
    // ========================================================================

    /// Logical id for a key, probing the store for unknown native ids
    async fn resolve_identity(&self, key: &ItemKey) -> Result<String> {
        if let Some(id) = self.ledger.resolve(key) {
            return Ok(id);
        }

        let (store, native_id) = match key {
            ItemKey::Logical { id } => return Err(SyncError::ItemNotFound(id.clone())),
            ItemKey::Native { store, native_id } => (*store, native_id),
        };

        let endpoint = self.stores.get(store);
        let item = self
            .io("fetch_item", endpoint.client.fetch_item(native_id))
            .await?
            .ok_or_else(|| SyncError::ItemNotFound(key.to_string()))?;
        let doc = self
            .io("to_canonical", endpoint.converter.to_canonical(&item))
            .await?;

        let logical_id = if doc.id.is_empty() {
            native_id.clone()
        } else {
            doc.id.clone()
        };
        self.follow_rename(&logical_id, store, native_id).await?;

        let mut refs = doc.store_refs;
        refs.insert(store, native_id.clone());
        self.ledger.bind_all(&logical_id, &refs)?;

        tracing::debug!(key = %key, item = %logical_id, "Resolved item identity");
        Ok(logical_id)
    }

    /// A known item found under a new native id was renamed when its old
    /// native id no longer exists. A still-present old id is left alone so
    /// binding reports the duplicate.
    async fn follow_rename(&self, logical_id: &str, store: StoreId, native_id: &str) -> Result<()> {
        let Some(previous) = self.ledger.native_id(logical_id, store) else {
            return Ok(());
        };
        if previous == native_id {
            return Ok(());
        }

        let client = &self.stores.get(store).client;
        if self
            .io("fetch_item", client.fetch_item(&previous))
            .await?
            .is_some()
        {
            return Ok(());
        }

        self.ledger.relink(logical_id, store, &previous, native_id)?;
        tracing::info!(
            item = %logical_id,
            store = %store,
            from = %previous,
            to = %native_id,
            "Item moved, ref updated"
        );
        Ok(())
    }

    /// Always reads the store; event payloads are never trusted as content
    async fn fetch_side(&self, store: StoreId, logical_id: &str) -> Result<Option<Snapshot>> {
        let Some(native_id) = self.ledger.native_id(logical_id, store) else {
            return Ok(None);
        };

        let endpoint = self.stores.get(store);
        let Some(item) = self
            .io("fetch_item", endpoint.client.fetch_item(&native_id))
            .await?
        else {
            return Ok(None);
        };

        let mut doc = self
            .io("to_canonical", endpoint.converter.to_canonical(&item))
            .await?;
        if doc.id != logical_id {
            tracing::debug!(store = %store, native_id = %native_id, found = %doc.id, item = %logical_id, "Converter id differs from ledger, using ledger");
            doc.id = logical_id.to_string();
        }
        doc.store_refs.insert(store, native_id);
        doc.source_timestamps.insert(store, item.modified_at);

        Ok(Some(Snapshot {
            store,
            modified_at: item.modified_at,
            doc,
        }))
    }

    /// Run a collaborator call under the I/O timeout
    async fn io<T, E, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<SyncError>,
    {
        let limit = Duration::from_millis(self.config.io_timeout_ms);
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(SyncError::Timeout {
                operation,
                millis: self.config.io_timeout_ms,
            }),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let millis = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.config.backoff_max_ms);
        Duration::from_millis(millis)
    }

    // ========================================================================
    // Outcomes
    // ========================================================================

    async fn finish_success(&self, task: &SyncTask, outcome: SyncOutcome) -> TaskStatus {
        self.success_count.fetch_add(1, Ordering::SeqCst);
        *self.last_sync.lock() = Some(Utc::now());

        if let Some(id) = &task.logical_id {
            if self.decisions.lock().remove(id).is_some() {
                tracing::info!(item = %id, "Pending decision resolved");
            }
        }

        tracing::info!(
            task_id = %task.id,
            item = %task.outcome_key(),
            attempts = task.attempt,
            written = ?outcome.written(),
            "Sync task succeeded"
        );

        self.emit_outcome(
            task,
            EventKind::SyncCompleted,
            PRIORITY_SYNC_COMPLETE,
            json!({ "taskId": task.id, "result": outcome }),
        )
        .await;

        TaskStatus::Succeeded { outcome }
    }

    async fn finish_failure(
        &self,
        task: &mut SyncTask,
        err: SyncError,
        event: Option<&ChangeEvent>,
    ) -> TaskStatus {
        if let Err(e) = task.transition(TaskPhase::Failed) {
            tracing::debug!(task_id = %task.id, "{}", e);
        }

        let reason = FailureReason::from_error(&err, task.attempt);
        let message = err.to_string();

        if let FailureReason::NeedsUserInput { conflicts } = reason {
            tracing::info!(task_id = %task.id, item = %task.outcome_key(), conflicts, "Sync task needs a decision");
            self.emit_outcome(
                task,
                EventKind::DecisionRequired,
                PRIORITY_SYNC_ERROR,
                json!({ "taskId": task.id, "conflicts": conflicts }),
            )
            .await;
        } else if matches!(err, SyncError::LockTimeout(_)) && self.requeue(event) {
            tracing::warn!(task_id = %task.id, item = %task.item_key, "Lock timeout, event re-enqueued at lowest priority");
        } else {
            self.error_count.fetch_add(1, Ordering::SeqCst);
            self.record_failure(task, &reason, &message);

            tracing::error!(
                task_id = %task.id,
                item = %task.outcome_key(),
                attempts = task.attempt,
                reason = %reason,
                "Sync task failed: {}",
                message
            );

            self.emit_outcome(
                task,
                EventKind::SyncFailed,
                PRIORITY_SYNC_ERROR,
                json!({ "taskId": task.id, "reason": reason, "message": message }),
            )
            .await;
        }

        TaskStatus::Failed { reason, message }
    }

    /// Re-enqueue a first-time event once; returns whether it was queued
    fn requeue(&self, event: Option<&ChangeEvent>) -> bool {
        match event {
            Some(event) if event.redelivery == 0 => {
                self.bus.try_emit(event.redelivered()).is_enqueued()
            }
            _ => false,
        }
    }

    fn record_failure(&self, task: &SyncTask, reason: &FailureReason, message: &str) {
        let capacity = self.config.failed_task_capacity;
        if capacity == 0 {
            return;
        }
        let mut failures = self.failures.lock();
        while failures.len() >= capacity {
            failures.pop_front();
        }
        failures.push_back(TaskRecord {
            task_id: task.id.clone(),
            item_key: task.outcome_key(),
            direction: task.direction,
            attempts: task.attempt,
            reason: reason.clone(),
            message: message.to_string(),
            finished_at: Utc::now(),
        });
    }

    async fn emit_outcome(
        &self,
        task: &SyncTask,
        kind: EventKind,
        priority: i32,
        payload: serde_json::Value,
    ) {
        let event = ChangeEvent::new(task.outcome_key(), task.source_store(), kind)
            .with_priority(priority)
            .with_payload(payload);
        if !self.bus.emit(event).await.is_enqueued() {
            tracing::debug!(task_id = %task.id, "Outcome event not enqueued");
        }
    }
}

/// Move a task to `phase` and publish progress
fn advance(
    task: &mut SyncTask,
    status: &watch::Sender<TaskStatus>,
    phase: TaskPhase,
) -> Result<()> {
    task.transition(phase)?;
    if !phase.is_terminal() {
        status.send_replace(TaskStatus::InProgress {
            phase,
            attempt: task.attempt,
        });
    }
    Ok(())
}
