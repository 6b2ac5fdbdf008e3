//! Append-only conflict resolution log
//!
//! Entries are write-once and shared as `Arc`. The log is bounded; the
//! statistics are cumulative counters and do not shrink when old entries
//! are evicted.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::types::{Conflict, ConflictStats, Resolution, ResolutionStrategy};

/// One recorded resolution
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub conflict: Conflict,
    pub resolution: Resolution,
    pub strategy: ResolutionStrategy,
    #[serde(rename = "resolvedAt")]
    pub resolved_at: DateTime<Utc>,
}

pub struct ConflictHistory {
    capacity: usize,
    inner: Mutex<HistoryInner>,
}

#[derive(Default)]
struct HistoryInner {
    entries: VecDeque<Arc<HistoryEntry>>,
    stats: ConflictStats,
}

impl ConflictHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(HistoryInner::default()),
        }
    }

    /// Append a resolution; returns the stored entry
    pub fn record(&self, conflict: &Conflict, resolution: &Resolution) -> Arc<HistoryEntry> {
        let entry = Arc::new(HistoryEntry {
            conflict: conflict.clone(),
            resolution: resolution.clone(),
            strategy: resolution.strategy,
            resolved_at: Utc::now(),
        });

        let mut inner = self.inner.lock();
        let stats = &mut inner.stats;
        stats.total += 1;
        if resolution.requires_manual_input {
            stats.pending_manual += 1;
        } else {
            stats.resolved_automatically += 1;
        }
        *stats.by_field.entry(conflict.field()).or_default() += 1;
        *stats.by_severity.entry(conflict.severity()).or_default() += 1;

        if self.capacity > 0 {
            while inner.entries.len() >= self.capacity {
                inner.entries.pop_front();
            }
            inner.entries.push_back(entry.clone());
        }
        entry
    }

    /// Most recent entries, newest last
    pub fn recent(&self, limit: usize) -> Vec<Arc<HistoryEntry>> {
        let inner = self.inner.lock();
        let skip = inner.entries.len().saturating_sub(limit);
        inner.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ConflictStats {
        let mut stats = self.inner.lock().stats.clone();
        stats.resolution_rate = if stats.total == 0 {
            0.0
        } else {
            stats.resolved_automatically as f64 / stats.total as f64
        };
        stats
    }

    /// Drop retained entries and reset counters
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.stats = ConflictStats::default();
        tracing::info!("Conflict history cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::types::{ConflictField, ConflictValues, FieldValue};
    use chrono::TimeZone;

    fn title_conflict(remote: &str, local: &str) -> Conflict {
        let t = Utc.timestamp_opt(100, 0).unwrap();
        Conflict {
            item_id: "doc-1".into(),
            values: ConflictValues::Title {
                remote: remote.into(),
                local: local.into(),
            },
            remote_timestamp: t,
            local_timestamp: t,
        }
    }

    fn resolution(manual: bool) -> Resolution {
        Resolution {
            resolved_value: (!manual).then(|| FieldValue::Title("Foo".into())),
            reason: "test".into(),
            strategy: if manual {
                ResolutionStrategy::ManualChoice
            } else {
                ResolutionStrategy::PreferRemote
            },
            confidence: 0.8,
            requires_manual_input: manual,
            options: Vec::new(),
        }
    }

    #[test]
    fn test_stats_count_outcomes() {
        let history = ConflictHistory::new(10);
        history.record(&title_conflict("Foo", "Bar"), &resolution(false));
        history.record(&title_conflict("Foo", "Baz"), &resolution(false));
        history.record(&title_conflict("Foo", "Qux"), &resolution(true));

        let stats = history.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.resolved_automatically, 2);
        assert_eq!(stats.pending_manual, 1);
        assert_eq!(stats.by_field[&ConflictField::Title], 3);
        assert!((stats.resolution_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_eviction_keeps_cumulative_stats() {
        let history = ConflictHistory::new(2);
        for _ in 0..5 {
            history.record(&title_conflict("Foo", "Bar"), &resolution(false));
        }

        assert_eq!(history.len(), 2);
        assert_eq!(history.stats().total, 5);
        assert_eq!(history.recent(10).len(), 2);

        history.clear();
        assert!(history.is_empty());
        assert_eq!(history.stats().total, 0);
        assert_eq!(history.stats().resolution_rate, 0.0);
    }
}
