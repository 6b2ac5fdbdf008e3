//! Identity ledger
//!
//! Maps logical items to their native ids in each store and remembers the
//! modification instants recorded at the last successful sync. A native id,
//! once bound, always refers to the same logical item.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::document::{ItemKey, StoreId};
use crate::error::{Result, SyncError};

/// Sync bookkeeping for one logical item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(rename = "storeRefs")]
    pub store_refs: BTreeMap<StoreId, String>,
    /// Instants recorded at the last successful sync, per side
    #[serde(rename = "sourceTimestamps")]
    pub source_timestamps: BTreeMap<StoreId, DateTime<Utc>>,
    #[serde(rename = "lastSynced", skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<DateTime<Utc>>,
}

/// Serializable copy of the ledger, for callers that persist it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub entries: BTreeMap<String, LedgerEntry>,
    #[serde(rename = "lastBulkSync", skip_serializing_if = "Option::is_none")]
    pub last_bulk_sync: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct LedgerState {
    entries: HashMap<String, LedgerEntry>,
    by_native: HashMap<(StoreId, String), String>,
    last_bulk_sync: Option<DateTime<Utc>>,
}

impl LedgerState {
    fn check_bind(&self, logical_id: &str, store: StoreId, native_id: &str) -> Result<()> {
        if let Some(existing) = self.by_native.get(&(store, native_id.to_string())) {
            if existing != logical_id {
                return Err(SyncError::IdentityConflict {
                    store,
                    native_id: native_id.to_string(),
                    existing: existing.clone(),
                    requested: logical_id.to_string(),
                });
            }
        }
        if let Some(current) = self
            .entries
            .get(logical_id)
            .and_then(|entry| entry.store_refs.get(&store))
        {
            if current != native_id {
                return Err(SyncError::IdentityConflict {
                    store,
                    native_id: current.clone(),
                    existing: logical_id.to_string(),
                    requested: native_id.to_string(),
                });
            }
        }
        Ok(())
    }

    fn bind_unchecked(&mut self, logical_id: &str, store: StoreId, native_id: &str) {
        self.by_native
            .insert((store, native_id.to_string()), logical_id.to_string());
        self.entries
            .entry(logical_id.to_string())
            .or_default()
            .store_refs
            .insert(store, native_id.to_string());
    }
}

#[derive(Default)]
pub struct SyncLedger {
    state: RwLock<LedgerState>,
}

impl SyncLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logical id for an item key, if known
    pub fn resolve(&self, key: &ItemKey) -> Option<String> {
        let state = self.state.read();
        match key {
            ItemKey::Logical { id } => state.entries.contains_key(id).then(|| id.clone()),
            ItemKey::Native { store, native_id } => {
                state.by_native.get(&(*store, native_id.clone())).cloned()
            }
        }
    }

    pub fn entry(&self, logical_id: &str) -> Option<LedgerEntry> {
        self.state.read().entries.get(logical_id).cloned()
    }

    pub fn native_id(&self, logical_id: &str, store: StoreId) -> Option<String> {
        self.state
            .read()
            .entries
            .get(logical_id)
            .and_then(|entry| entry.store_refs.get(&store).cloned())
    }

    /// Bind a native id to a logical item. Rebinding is an identity conflict.
    pub fn bind(&self, logical_id: &str, store: StoreId, native_id: &str) -> Result<()> {
        let mut state = self.state.write();
        state.check_bind(logical_id, store, native_id)?;
        state.bind_unchecked(logical_id, store, native_id);
        Ok(())
    }

    /// Bind several refs at once; nothing is bound if any would conflict
    pub fn bind_all(&self, logical_id: &str, refs: &BTreeMap<StoreId, String>) -> Result<()> {
        let mut state = self.state.write();
        for (store, native_id) in refs {
            state.check_bind(logical_id, *store, native_id)?;
        }
        for (store, native_id) in refs {
            state.bind_unchecked(logical_id, *store, native_id);
        }
        Ok(())
    }

    /// Point an item's ref on `store` at a new native id after a rename.
    ///
    /// `previous` must still be the current ref. The old native id is
    /// released; the new one must not belong to another item.
    pub fn relink(
        &self,
        logical_id: &str,
        store: StoreId,
        previous: &str,
        native_id: &str,
    ) -> Result<()> {
        let mut state = self.state.write();
        if let Some(existing) = state.by_native.get(&(store, native_id.to_string())) {
            if existing != logical_id {
                return Err(SyncError::IdentityConflict {
                    store,
                    native_id: native_id.to_string(),
                    existing: existing.clone(),
                    requested: logical_id.to_string(),
                });
            }
        }

        let current = state
            .entries
            .get(logical_id)
            .and_then(|entry| entry.store_refs.get(&store))
            .cloned();
        if current.as_deref() != Some(previous) {
            return Err(SyncError::IdentityConflict {
                store,
                native_id: current.unwrap_or_default(),
                existing: logical_id.to_string(),
                requested: native_id.to_string(),
            });
        }

        state.by_native.remove(&(store, previous.to_string()));
        state.bind_unchecked(logical_id, store, native_id);
        Ok(())
    }

    /// Whether a side's fetched instant differs from the recorded one
    pub fn is_changed(&self, logical_id: &str, store: StoreId, modified_at: DateTime<Utc>) -> bool {
        self.recorded_at(logical_id, store) != Some(modified_at)
    }

    pub fn recorded_at(&self, logical_id: &str, store: StoreId) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .entries
            .get(logical_id)
            .and_then(|entry| entry.source_timestamps.get(&store).copied())
    }

    /// Record a successful sync. Sides absent from `timestamps` keep their
    /// previous instant.
    pub fn record_sync(&self, logical_id: &str, timestamps: &BTreeMap<StoreId, DateTime<Utc>>) {
        let mut state = self.state.write();
        let entry = state.entries.entry(logical_id.to_string()).or_default();
        for (store, at) in timestamps {
            entry.source_timestamps.insert(*store, *at);
        }
        entry.last_synced = Some(Utc::now());
    }

    pub fn last_bulk_sync(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_bulk_sync
    }

    pub fn set_last_bulk_sync(&self, at: DateTime<Utc>) {
        self.state.write().last_bulk_sync = Some(at);
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.read();
        LedgerSnapshot {
            entries: state
                .entries
                .iter()
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect(),
            last_bulk_sync: state.last_bulk_sync,
        }
    }

    /// Replace the ledger contents; fails if two items share a native id
    pub fn restore(&self, snapshot: LedgerSnapshot) -> Result<()> {
        let mut restored = LedgerState {
            last_bulk_sync: snapshot.last_bulk_sync,
            ..Default::default()
        };
        for (logical_id, entry) in snapshot.entries {
            for (store, native_id) in &entry.store_refs {
                restored.check_bind(&logical_id, *store, native_id)?;
                restored
                    .by_native
                    .insert((*store, native_id.clone()), logical_id.clone());
            }
            restored.entries.insert(logical_id, entry);
        }

        *self.state.write() = restored;
        tracing::info!(items = self.len(), "Restored sync ledger");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_bind_and_resolve() {
        let ledger = SyncLedger::new();
        ledger.bind("doc-1", StoreId::Remote, "page-1").unwrap();
        ledger.bind("doc-1", StoreId::Local, "doc-1.md").unwrap();

        assert_eq!(
            ledger.resolve(&ItemKey::native(StoreId::Local, "doc-1.md")),
            Some("doc-1".to_string())
        );
        assert_eq!(ledger.resolve(&ItemKey::logical("doc-1")), Some("doc-1".to_string()));
        assert_eq!(ledger.resolve(&ItemKey::logical("doc-2")), None);
        assert_eq!(ledger.native_id("doc-1", StoreId::Remote).as_deref(), Some("page-1"));

        // Rebinding the same pair is a no-op
        ledger.bind("doc-1", StoreId::Remote, "page-1").unwrap();
    }

    #[test]
    fn test_native_id_cannot_be_rebound() {
        let ledger = SyncLedger::new();
        ledger.bind("doc-1", StoreId::Remote, "page-1").unwrap();

        let err = ledger.bind("doc-2", StoreId::Remote, "page-1").unwrap_err();
        assert!(matches!(err, SyncError::IdentityConflict { .. }));

        let err = ledger.bind("doc-1", StoreId::Remote, "page-9").unwrap_err();
        assert!(matches!(err, SyncError::IdentityConflict { .. }));

        assert_eq!(
            ledger.resolve(&ItemKey::native(StoreId::Remote, "page-1")),
            Some("doc-1".to_string())
        );
    }

    #[test]
    fn test_relink_follows_rename() {
        let ledger = SyncLedger::new();
        ledger.bind("doc-1", StoreId::Local, "doc-1.md").unwrap();
        ledger.bind("doc-2", StoreId::Local, "doc-2.md").unwrap();

        ledger
            .relink("doc-1", StoreId::Local, "doc-1.md", "notes/doc-1.md")
            .unwrap();

        assert_eq!(ledger.resolve(&ItemKey::native(StoreId::Local, "doc-1.md")), None);
        assert_eq!(
            ledger.resolve(&ItemKey::native(StoreId::Local, "notes/doc-1.md")),
            Some("doc-1".to_string())
        );
        assert_eq!(ledger.native_id("doc-1", StoreId::Local).as_deref(), Some("notes/doc-1.md"));

        // Another item's native id is never taken over
        let err = ledger
            .relink("doc-1", StoreId::Local, "notes/doc-1.md", "doc-2.md")
            .unwrap_err();
        assert!(matches!(err, SyncError::IdentityConflict { .. }));

        // A stale previous ref is refused
        assert!(ledger
            .relink("doc-1", StoreId::Local, "doc-1.md", "archive/doc-1.md")
            .is_err());
        assert_eq!(ledger.native_id("doc-1", StoreId::Local).as_deref(), Some("notes/doc-1.md"));
    }

    #[test]
    fn test_bind_all_is_atomic() {
        let ledger = SyncLedger::new();
        ledger.bind("doc-1", StoreId::Local, "a.md").unwrap();

        let refs: BTreeMap<StoreId, String> = [
            (StoreId::Remote, "page-2".to_string()),
            (StoreId::Local, "a.md".to_string()),
        ]
        .into_iter()
        .collect();

        assert!(ledger.bind_all("doc-2", &refs).is_err());
        assert_eq!(ledger.resolve(&ItemKey::native(StoreId::Remote, "page-2")), None);
    }

    #[test]
    fn test_change_detection_uses_recorded_instants() {
        let ledger = SyncLedger::new();
        assert!(ledger.is_changed("doc-1", StoreId::Remote, at(100)));

        let mut timestamps = BTreeMap::new();
        timestamps.insert(StoreId::Remote, at(100));
        ledger.record_sync("doc-1", &timestamps);

        assert!(!ledger.is_changed("doc-1", StoreId::Remote, at(100)));
        assert!(ledger.is_changed("doc-1", StoreId::Remote, at(101)));
        assert!(ledger.is_changed("doc-1", StoreId::Local, at(100)));
        assert!(ledger.entry("doc-1").unwrap().last_synced.is_some());
    }

    #[test]
    fn test_snapshot_round_trip_rebuilds_index() {
        let ledger = SyncLedger::new();
        ledger.bind("doc-1", StoreId::Remote, "page-1").unwrap();
        ledger.set_last_bulk_sync(at(50));

        let json = serde_json::to_string(&ledger.snapshot()).unwrap();
        let restored = SyncLedger::new();
        restored.restore(serde_json::from_str(&json).unwrap()).unwrap();

        assert_eq!(
            restored.resolve(&ItemKey::native(StoreId::Remote, "page-1")),
            Some("doc-1".to_string())
        );
        assert_eq!(restored.last_bulk_sync(), Some(at(50)));
    }

    #[test]
    fn test_restore_rejects_shared_native_ids() {
        let mut snapshot = LedgerSnapshot::default();
        for id in ["doc-1", "doc-2"] {
            let mut entry = LedgerEntry::default();
            entry.store_refs.insert(StoreId::Remote, "page-1".into());
            snapshot.entries.insert(id.into(), entry);
        }

        let ledger = SyncLedger::new();
        assert!(ledger.restore(snapshot).is_err());
        assert!(ledger.is_empty());
    }
}
