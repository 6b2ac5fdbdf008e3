//! Conflict detection and resolution
//!
//! Compares two canonical snapshots of one logical item field by field and
//! resolves each divergence with a configurable strategy.
//!
//! # Strategies
//!
//! - `PreferRemote` / `PreferLocal`: always resolve, confidence 0.8
//! - `NewerWins`: later timestamp wins, remote on ties, confidence 0.9
//! - `Merge`: tag union, longer title, concatenated body
//! - `ManualChoice`: never resolves; offers both values plus a merge

mod detector;
mod history;
mod resolver;
mod types;

pub use detector::detect_conflicts;
pub use history::{ConflictHistory, HistoryEntry};
pub use resolver::{apply_strategy, ConflictResolver, MERGE_SEPARATOR};
pub use types::{
    Conflict, ConflictField, ConflictStats, ConflictValues, FieldValue, Resolution,
    ResolutionOption, ResolutionStrategy, Severity, UnknownStrategy,
};
