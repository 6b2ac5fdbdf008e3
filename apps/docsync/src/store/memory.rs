//! In-memory store and JSON converter
//!
//! Reference collaborators for embedding tests and demos. `MemoryStore`
//! keeps items in a map and can simulate latency and transient failures;
//! `JsonConverter` reads and writes the canonical fields as a JSON object.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;

use super::traits::{Converter, NativeItem, StoreClient};
use crate::document::{Block, CanonicalDocument, StoreId};
use crate::error::{ConversionError, StoreError};

// ============================================================================
// MemoryStore
// ============================================================================

/// Map-backed [`StoreClient`]
///
/// Writes keep the `modified_at` of the written item, the way a file store
/// preserves an explicitly set mtime.
pub struct MemoryStore {
    store: StoreId,
    latency: Duration,
    items: Mutex<BTreeMap<String, NativeItem>>,
    next_id: AtomicU64,
    failing_fetches: AtomicU32,
    failing_writes: AtomicU32,
    fetches: AtomicU64,
    writes: AtomicU64,
    probe: Mutex<FetchProbe>,
}

/// Tracks concurrent fetches per item
#[derive(Default)]
struct FetchProbe {
    active: HashMap<String, usize>,
    max: HashMap<String, usize>,
}

impl MemoryStore {
    pub fn new(store: StoreId) -> Self {
        Self {
            store,
            latency: Duration::ZERO,
            items: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            failing_fetches: AtomicU32::new(0),
            failing_writes: AtomicU32::new(0),
            fetches: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            probe: Mutex::new(FetchProbe::default()),
        }
    }

    /// Delay applied to every fetch and write
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Put an item directly, bypassing counters
    pub fn insert(&self, native_id: &str, modified_at: DateTime<Utc>, data: serde_json::Value) {
        self.items
            .lock()
            .insert(native_id.to_string(), NativeItem::new(native_id, modified_at, data));
    }

    pub fn remove(&self, native_id: &str) -> Option<NativeItem> {
        self.items.lock().remove(native_id)
    }

    pub fn get(&self, native_id: &str) -> Option<NativeItem> {
        self.items.lock().get(native_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the next `count` fetches fail with a transient error
    pub fn fail_next_fetches(&self, count: u32) {
        self.failing_fetches.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` writes fail with a transient error
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping fetches observed for one item
    pub fn max_concurrent_fetches(&self, native_id: &str) -> usize {
        self.probe.lock().max.get(native_id).copied().unwrap_or(0)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    fn store(&self) -> StoreId {
        self.store
    }

    async fn fetch_item(&self, native_id: &str) -> Result<Option<NativeItem>, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        {
            let mut probe = self.probe.lock();
            let active = probe.active.entry(native_id.to_string()).or_default();
            *active += 1;
            let current = *active;
            let max = probe.max.entry(native_id.to_string()).or_default();
            *max = (*max).max(current);
        }

        self.simulate_latency().await;

        {
            let mut probe = self.probe.lock();
            if let Some(active) = probe.active.get_mut(native_id) {
                *active = active.saturating_sub(1);
            }
        }

        if Self::take_failure(&self.failing_fetches) {
            return Err(StoreError::Transient(format!(
                "simulated {} fetch failure for {}",
                self.store, native_id
            )));
        }

        Ok(self.get(native_id))
    }

    async fn list_changed_since(&self, since: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        Ok(self
            .items
            .lock()
            .values()
            .filter(|item| item.modified_at > since)
            .map(|item| item.native_id.clone())
            .collect())
    }

    async fn write_item(
        &self,
        native_id: Option<&str>,
        mut item: NativeItem,
    ) -> Result<String, StoreError> {
        self.simulate_latency().await;

        if Self::take_failure(&self.failing_writes) {
            return Err(StoreError::Transient(format!("simulated {} write failure", self.store)));
        }

        let native_id = match native_id {
            Some(id) => id.to_string(),
            None => format!(
                "{}-{}",
                self.store,
                self.next_id.fetch_add(1, Ordering::SeqCst)
            ),
        };

        self.writes.fetch_add(1, Ordering::SeqCst);
        item.native_id = native_id.clone();
        self.items.lock().insert(native_id.clone(), item);

        tracing::debug!(store = %self.store, native_id = %native_id, "Wrote item");
        Ok(native_id)
    }
}

// ============================================================================
// JsonConverter
// ============================================================================

/// Canonical fields as a JSON object:
/// `{"id", "title", "body": [blocks], "tags": [..], "refs": {store: id}}`
pub struct JsonConverter {
    store: StoreId,
}

#[derive(Deserialize)]
struct JsonDocument {
    #[serde(default)]
    id: Option<String>,
    title: String,
    #[serde(default)]
    body: Vec<Block>,
    #[serde(default)]
    tags: BTreeSet<String>,
    #[serde(default)]
    refs: BTreeMap<StoreId, String>,
}

impl JsonConverter {
    pub fn new(store: StoreId) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Converter for JsonConverter {
    async fn to_canonical(&self, item: &NativeItem) -> Result<CanonicalDocument, ConversionError> {
        let parsed: JsonDocument =
            serde_json::from_value(item.data.clone()).map_err(|e| ConversionError::Malformed {
                store: self.store,
                native_id: item.native_id.clone(),
                message: e.to_string(),
            })?;

        // Items created directly in a store carry no logical id yet
        let id = parsed
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| item.native_id.clone());

        let mut doc = CanonicalDocument::new(id, parsed.title)
            .with_body(parsed.body)
            .with_ref(self.store, item.native_id.clone())
            .with_timestamp(self.store, item.modified_at);
        doc.tags = parsed.tags;
        doc.absorb_refs(&parsed.refs);
        Ok(doc)
    }

    async fn from_canonical(&self, doc: &CanonicalDocument) -> Result<NativeItem, ConversionError> {
        let refs: BTreeMap<StoreId, &String> = doc
            .store_refs
            .iter()
            .filter(|(store, _)| **store != self.store)
            .map(|(store, id)| (*store, id))
            .collect();

        let data = json!({
            "id": doc.id,
            "title": doc.title,
            "body": doc.body,
            "tags": doc.tags,
            "refs": refs,
        });

        let modified_at = doc
            .source_timestamps
            .values()
            .max()
            .copied()
            .unwrap_or_else(Utc::now);

        Ok(NativeItem {
            native_id: doc.store_refs.get(&self.store).cloned().unwrap_or_default(),
            modified_at,
            data,
        })
    }
}
