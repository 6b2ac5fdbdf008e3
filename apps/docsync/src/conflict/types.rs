//! Conflict and resolution types

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::document::{Block, CanonicalDocument, StoreId};

/// Field of a document that can diverge
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictField {
    Title,
    Body,
    Tags,
}

impl ConflictField {
    /// Fixed per field; used for reporting and ordering only
    pub fn severity(self) -> Severity {
        match self {
            ConflictField::Tags => Severity::Low,
            ConflictField::Title => Severity::Medium,
            ConflictField::Body => Severity::High,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConflictField::Title => "title",
            ConflictField::Body => "body",
            ConflictField::Tags => "tags",
        }
    }
}

impl fmt::Display for ConflictField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// A value for one conflicting field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    Title(String),
    Body(Vec<Block>),
    Tags(BTreeSet<String>),
}

impl FieldValue {
    pub fn field(&self) -> ConflictField {
        match self {
            FieldValue::Title(_) => ConflictField::Title,
            FieldValue::Body(_) => ConflictField::Body,
            FieldValue::Tags(_) => ConflictField::Tags,
        }
    }

    /// Write this value into the matching field of a document
    pub fn apply_to(self, doc: &mut CanonicalDocument) {
        match self {
            FieldValue::Title(title) => doc.title = title,
            FieldValue::Body(body) => doc.body = body,
            FieldValue::Tags(tags) => doc.tags = tags,
        }
    }
}

/// Both sides of a diverged field, one variant per field type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "lowercase")]
pub enum ConflictValues {
    Title { remote: String, local: String },
    Body { remote: Vec<Block>, local: Vec<Block> },
    Tags { remote: BTreeSet<String>, local: BTreeSet<String> },
}

/// A detected divergence in one field of one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    #[serde(rename = "itemId")]
    pub item_id: String,
    pub values: ConflictValues,
    #[serde(rename = "remoteTimestamp")]
    pub remote_timestamp: DateTime<Utc>,
    #[serde(rename = "localTimestamp")]
    pub local_timestamp: DateTime<Utc>,
}

impl Conflict {
    pub fn field(&self) -> ConflictField {
        match self.values {
            ConflictValues::Title { .. } => ConflictField::Title,
            ConflictValues::Body { .. } => ConflictField::Body,
            ConflictValues::Tags { .. } => ConflictField::Tags,
        }
    }

    pub fn severity(&self) -> Severity {
        self.field().severity()
    }

    /// The value held by one side
    pub fn value(&self, store: StoreId) -> FieldValue {
        match (&self.values, store) {
            (ConflictValues::Title { remote, .. }, StoreId::Remote) => FieldValue::Title(remote.clone()),
            (ConflictValues::Title { local, .. }, StoreId::Local) => FieldValue::Title(local.clone()),
            (ConflictValues::Body { remote, .. }, StoreId::Remote) => FieldValue::Body(remote.clone()),
            (ConflictValues::Body { local, .. }, StoreId::Local) => FieldValue::Body(local.clone()),
            (ConflictValues::Tags { remote, .. }, StoreId::Remote) => FieldValue::Tags(remote.clone()),
            (ConflictValues::Tags { local, .. }, StoreId::Local) => FieldValue::Tags(local.clone()),
        }
    }

    pub fn timestamp(&self, store: StoreId) -> DateTime<Utc> {
        match store {
            StoreId::Remote => self.remote_timestamp,
            StoreId::Local => self.local_timestamp,
        }
    }
}

/// How to resolve a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Keep the remote store's value
    PreferRemote,
    /// Keep the local store's value
    PreferLocal,
    /// Keep the most recently modified value, remote on ties
    NewerWins,
    /// Field-specific merge (tag union, longer title, concatenated body)
    Merge,
    /// Ask a human
    ManualChoice,
}

impl ResolutionStrategy {
    pub const ALL: [ResolutionStrategy; 5] = [
        ResolutionStrategy::PreferRemote,
        ResolutionStrategy::PreferLocal,
        ResolutionStrategy::NewerWins,
        ResolutionStrategy::Merge,
        ResolutionStrategy::ManualChoice,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ResolutionStrategy::PreferRemote => "prefer_remote",
            ResolutionStrategy::PreferLocal => "prefer_local",
            ResolutionStrategy::NewerWins => "newer_wins",
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::ManualChoice => "manual_choice",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown resolution strategy: {0}")]
pub struct UnknownStrategy(pub String);

impl FromStr for ResolutionStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "prefer_remote" | "prefer_a" | "remote" => Ok(ResolutionStrategy::PreferRemote),
            "prefer_local" | "prefer_b" | "local" => Ok(ResolutionStrategy::PreferLocal),
            "newer_wins" | "newest" => Ok(ResolutionStrategy::NewerWins),
            "merge" => Ok(ResolutionStrategy::Merge),
            "manual_choice" | "manual" | "user_choice" => Ok(ResolutionStrategy::ManualChoice),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}

/// A candidate value offered for a manual decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionOption {
    pub label: String,
    pub value: FieldValue,
}

/// Outcome of applying a strategy to a conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Absent when a manual decision is required
    #[serde(rename = "resolvedValue")]
    pub resolved_value: Option<FieldValue>,
    /// Human-readable rule that produced the value
    pub reason: String,
    pub strategy: ResolutionStrategy,
    /// 0..=1
    pub confidence: f64,
    #[serde(rename = "requiresManualInput")]
    pub requires_manual_input: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<ResolutionOption>,
}

impl Resolution {
    pub(crate) fn resolved(
        value: FieldValue,
        strategy: ResolutionStrategy,
        reason: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            resolved_value: Some(value),
            reason: reason.into(),
            strategy,
            confidence,
            requires_manual_input: false,
            options: Vec::new(),
        }
    }
}

/// Conflict statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConflictStats {
    pub total: u64,
    #[serde(rename = "resolvedAutomatically")]
    pub resolved_automatically: u64,
    #[serde(rename = "pendingManual")]
    pub pending_manual: u64,
    #[serde(rename = "byFieldType")]
    pub by_field: BTreeMap<ConflictField, u64>,
    #[serde(rename = "bySeverity")]
    pub by_severity: BTreeMap<Severity, u64>,
    #[serde(rename = "resolutionRate")]
    pub resolution_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(ConflictField::Tags.severity() < ConflictField::Title.severity());
        assert!(ConflictField::Title.severity() < ConflictField::Body.severity());
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("prefer_a".parse::<ResolutionStrategy>().unwrap(), ResolutionStrategy::PreferRemote);
        assert_eq!("Prefer-B".parse::<ResolutionStrategy>().unwrap(), ResolutionStrategy::PreferLocal);
        assert_eq!("newer_wins".parse::<ResolutionStrategy>().unwrap(), ResolutionStrategy::NewerWins);
        assert!("coin_flip".parse::<ResolutionStrategy>().is_err());

        for strategy in ResolutionStrategy::ALL {
            assert_eq!(strategy.name().parse::<ResolutionStrategy>().unwrap(), strategy);
        }
    }

    #[test]
    fn test_field_value_applies_to_document() {
        let mut doc = CanonicalDocument::new("doc-1", "Old");
        FieldValue::Title("New".into()).apply_to(&mut doc);
        FieldValue::Tags(["x".to_string()].into_iter().collect()).apply_to(&mut doc);

        assert_eq!(doc.title, "New");
        assert!(doc.tags.contains("x"));
    }
}
