//! Conflict resolution
//!
//! Strategies are pure functions of the conflict. The resolver adds the
//! configurable policy (default strategy, per-field overrides) and records
//! every resolution in the history log.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;

use super::detector::detect_conflicts;
use super::history::{ConflictHistory, HistoryEntry};
use super::types::{
    Conflict, ConflictField, ConflictStats, ConflictValues, FieldValue, Resolution,
    ResolutionOption, ResolutionStrategy,
};
use crate::document::{Block, CanonicalDocument, StoreId};

const CONFIDENCE_PREFER: f64 = 0.8;
const CONFIDENCE_NEWER: f64 = 0.9;
const CONFIDENCE_MERGE_TAGS: f64 = 0.9;
const CONFIDENCE_MERGE_TITLE: f64 = 0.7;
const CONFIDENCE_MERGE_BODY: f64 = 0.6;
const CONFIDENCE_MANUAL: f64 = 1.0;

/// Text of the paragraph inserted between the two bodies of a merge
pub const MERGE_SEPARATOR: &str = "---";

/// Conflict resolver with configurable strategies
pub struct ConflictResolver {
    default_strategy: ResolutionStrategy,
    field_strategies: RwLock<BTreeMap<ConflictField, ResolutionStrategy>>,
    history: ConflictHistory,
}

impl ConflictResolver {
    pub fn new(default_strategy: ResolutionStrategy, history_capacity: usize) -> Self {
        Self {
            default_strategy,
            field_strategies: RwLock::new(BTreeMap::new()),
            history: ConflictHistory::new(history_capacity),
        }
    }

    pub fn default_strategy(&self) -> ResolutionStrategy {
        self.default_strategy
    }

    /// Strategy used for a field when none is requested explicitly
    pub fn strategy_for(&self, field: ConflictField) -> ResolutionStrategy {
        self.field_strategies
            .read()
            .get(&field)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    pub fn set_field_strategy(&self, field: ConflictField, strategy: ResolutionStrategy) {
        self.field_strategies.write().insert(field, strategy);
        tracing::info!(field = %field, strategy = %strategy, "Set resolution strategy");
    }

    pub fn clear_field_strategy(&self, field: ConflictField) {
        self.field_strategies.write().remove(&field);
    }

    pub fn available_strategies(&self) -> &'static [ResolutionStrategy] {
        &ResolutionStrategy::ALL
    }

    pub fn detect(&self, remote: &CanonicalDocument, local: &CanonicalDocument) -> Vec<Conflict> {
        detect_conflicts(remote, local)
    }

    /// Resolve with an explicit strategy and record the outcome
    pub fn resolve(&self, conflict: &Conflict, strategy: ResolutionStrategy) -> Resolution {
        let resolution = apply_strategy(conflict, strategy);
        self.history.record(conflict, &resolution);

        tracing::debug!(
            item = %conflict.item_id,
            field = %conflict.field(),
            strategy = %strategy,
            manual = resolution.requires_manual_input,
            "Resolved conflict"
        );
        resolution
    }

    /// Resolve a batch; `None` uses the configured per-field strategy
    pub fn resolve_all(
        &self,
        conflicts: &[Conflict],
        strategy: Option<ResolutionStrategy>,
    ) -> Vec<(Conflict, Resolution)> {
        conflicts
            .iter()
            .map(|conflict| {
                let strategy = strategy.unwrap_or_else(|| self.strategy_for(conflict.field()));
                (conflict.clone(), self.resolve(conflict, strategy))
            })
            .collect()
    }

    pub fn stats(&self) -> ConflictStats {
        self.history.stats()
    }

    pub fn history(&self, limit: usize) -> Vec<Arc<HistoryEntry>> {
        self.history.recent(limit)
    }

    pub fn clear_history(&self) {
        self.history.clear();
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ResolutionStrategy::NewerWins, 1000)
    }
}

/// Apply a strategy to a conflict without recording it
pub fn apply_strategy(conflict: &Conflict, strategy: ResolutionStrategy) -> Resolution {
    match strategy {
        ResolutionStrategy::PreferRemote => Resolution::resolved(
            conflict.value(StoreId::Remote),
            strategy,
            "Remote priority rule",
            CONFIDENCE_PREFER,
        ),
        ResolutionStrategy::PreferLocal => Resolution::resolved(
            conflict.value(StoreId::Local),
            strategy,
            "Local priority rule",
            CONFIDENCE_PREFER,
        ),
        ResolutionStrategy::NewerWins => resolve_newer_wins(conflict),
        ResolutionStrategy::Merge => {
            let (value, reason, confidence) = merge_values(&conflict.values);
            Resolution::resolved(value, strategy, reason, confidence)
        }
        ResolutionStrategy::ManualChoice => resolve_manual(conflict),
    }
}

fn resolve_newer_wins(conflict: &Conflict) -> Resolution {
    let (winner, reason) = if conflict.remote_timestamp > conflict.local_timestamp {
        (StoreId::Remote, "Newer wins rule (remote)")
    } else if conflict.local_timestamp > conflict.remote_timestamp {
        (StoreId::Local, "Newer wins rule (local)")
    } else {
        (StoreId::Remote, "Newer wins tie, remote priority rule")
    };

    Resolution::resolved(
        conflict.value(winner),
        ResolutionStrategy::NewerWins,
        reason,
        CONFIDENCE_NEWER,
    )
}

fn resolve_manual(conflict: &Conflict) -> Resolution {
    let (merged, _, _) = merge_values(&conflict.values);
    Resolution {
        resolved_value: None,
        reason: "User choice required".to_string(),
        strategy: ResolutionStrategy::ManualChoice,
        confidence: CONFIDENCE_MANUAL,
        requires_manual_input: true,
        options: vec![
            ResolutionOption {
                label: "Remote version".to_string(),
                value: conflict.value(StoreId::Remote),
            },
            ResolutionOption {
                label: "Local version".to_string(),
                value: conflict.value(StoreId::Local),
            },
            ResolutionOption {
                label: "Merge both versions".to_string(),
                value: merged,
            },
        ],
    }
}

fn merge_values(values: &ConflictValues) -> (FieldValue, &'static str, f64) {
    match values {
        ConflictValues::Tags { remote, local } => {
            let union: BTreeSet<String> = remote.union(local).cloned().collect();
            (
                FieldValue::Tags(union),
                "Merged tags (both versions)",
                CONFIDENCE_MERGE_TAGS,
            )
        }
        ConflictValues::Title { remote, local } => {
            let longer = if local.chars().count() > remote.chars().count() {
                local
            } else {
                remote
            };
            (
                FieldValue::Title(longer.clone()),
                "Merged titles (longer version)",
                CONFIDENCE_MERGE_TITLE,
            )
        }
        ConflictValues::Body { remote, local } => {
            let mut body = Vec::with_capacity(remote.len() + local.len() + 1);
            body.extend(remote.iter().cloned());
            body.push(Block::paragraph(MERGE_SEPARATOR));
            body.extend(local.iter().cloned());
            (
                FieldValue::Body(body),
                "Merged content (both versions)",
                CONFIDENCE_MERGE_BODY,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn conflict(values: ConflictValues, remote: i64, local: i64) -> Conflict {
        Conflict {
            item_id: "doc-1".into(),
            values,
            remote_timestamp: at(remote),
            local_timestamp: at(local),
        }
    }

    fn title(remote: &str, local: &str) -> ConflictValues {
        ConflictValues::Title {
            remote: remote.into(),
            local: local.into(),
        }
    }

    fn tags(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_prefer_strategies() {
        let c = conflict(title("Foo", "Bar"), 100, 200);

        let remote = apply_strategy(&c, ResolutionStrategy::PreferRemote);
        assert_eq!(remote.resolved_value, Some(FieldValue::Title("Foo".into())));
        assert_eq!(remote.confidence, 0.8);

        let local = apply_strategy(&c, ResolutionStrategy::PreferLocal);
        assert_eq!(local.resolved_value, Some(FieldValue::Title("Bar".into())));
        assert!(!local.requires_manual_input);
    }

    #[test]
    fn test_newer_wins_picks_newer() {
        let remote_newer = conflict(title("Foo", "Bar"), 200, 100);
        let resolution = apply_strategy(&remote_newer, ResolutionStrategy::NewerWins);
        assert_eq!(resolution.resolved_value, Some(FieldValue::Title("Foo".into())));
        assert_eq!(resolution.confidence, 0.9);
        assert!(!resolution.requires_manual_input);

        let local_newer = conflict(title("Foo", "Bar"), 100, 200);
        let resolution = apply_strategy(&local_newer, ResolutionStrategy::NewerWins);
        assert_eq!(resolution.resolved_value, Some(FieldValue::Title("Bar".into())));
    }

    #[test]
    fn test_newer_wins_tie_prefers_remote() {
        let tie = conflict(title("Foo", "Bar"), 100, 100);
        for _ in 0..10 {
            let resolution = apply_strategy(&tie, ResolutionStrategy::NewerWins);
            assert_eq!(resolution.resolved_value, Some(FieldValue::Title("Foo".into())));
            assert_eq!(resolution.confidence, 0.9);
        }
    }

    #[test]
    fn test_merge_tags_is_union() {
        let c = conflict(
            ConflictValues::Tags {
                remote: tags(&["x", "y"]),
                local: tags(&["y", "z"]),
            },
            1,
            2,
        );

        let resolution = apply_strategy(&c, ResolutionStrategy::Merge);

        assert_eq!(resolution.resolved_value, Some(FieldValue::Tags(tags(&["x", "y", "z"]))));
        assert_eq!(resolution.confidence, 0.9);
    }

    #[test]
    fn test_merge_title_keeps_longer() {
        let c = conflict(title("Plan", "Plan for Q3"), 1, 2);
        let resolution = apply_strategy(&c, ResolutionStrategy::Merge);
        assert_eq!(resolution.resolved_value, Some(FieldValue::Title("Plan for Q3".into())));
        assert_eq!(resolution.confidence, 0.7);

        let same_length = conflict(title("Abc", "Xyz"), 1, 2);
        let resolution = apply_strategy(&same_length, ResolutionStrategy::Merge);
        assert_eq!(resolution.resolved_value, Some(FieldValue::Title("Abc".into())));
    }

    #[test]
    fn test_merge_body_concatenates_with_separator() {
        let c = conflict(
            ConflictValues::Body {
                remote: vec![Block::paragraph("remote text")],
                local: vec![Block::paragraph("local text")],
            },
            1,
            2,
        );

        let resolution = apply_strategy(&c, ResolutionStrategy::Merge);

        assert_eq!(
            resolution.resolved_value,
            Some(FieldValue::Body(vec![
                Block::paragraph("remote text"),
                Block::paragraph(MERGE_SEPARATOR),
                Block::paragraph("local text"),
            ]))
        );
        assert_eq!(resolution.confidence, 0.6);
    }

    #[test]
    fn test_manual_choice_offers_options() {
        let c = conflict(title("Foo", "Bar"), 1, 2);
        let resolution = apply_strategy(&c, ResolutionStrategy::ManualChoice);

        assert!(resolution.requires_manual_input);
        assert!(resolution.resolved_value.is_none());
        assert_eq!(resolution.confidence, 1.0);
        assert_eq!(resolution.options.len(), 3);
        assert_eq!(resolution.options[2].label, "Merge both versions");
    }

    #[test]
    fn test_resolver_records_history_and_stats() {
        let resolver = ConflictResolver::new(ResolutionStrategy::NewerWins, 100);
        let c = conflict(title("Foo", "Bar"), 1, 2);

        resolver.resolve(&c, ResolutionStrategy::NewerWins);
        resolver.resolve(&c, ResolutionStrategy::ManualChoice);

        let stats = resolver.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.resolved_automatically, 1);
        assert_eq!(stats.pending_manual, 1);
        assert_eq!(stats.resolution_rate, 0.5);

        let history = resolver.history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].strategy, ResolutionStrategy::ManualChoice);
    }

    #[test]
    fn test_field_strategy_override() {
        let resolver = ConflictResolver::default();
        resolver.set_field_strategy(ConflictField::Tags, ResolutionStrategy::Merge);

        let conflicts = vec![
            conflict(title("Foo", "Bar"), 1, 2),
            conflict(
                ConflictValues::Tags {
                    remote: tags(&["a"]),
                    local: tags(&["b"]),
                },
                1,
                2,
            ),
        ];

        let resolved = resolver.resolve_all(&conflicts, None);
        assert_eq!(resolved[0].1.strategy, ResolutionStrategy::NewerWins);
        assert_eq!(resolved[1].1.strategy, ResolutionStrategy::Merge);

        resolver.clear_field_strategy(ConflictField::Tags);
        assert_eq!(resolver.strategy_for(ConflictField::Tags), ResolutionStrategy::NewerWins);
    }
}
