//! Canonical document model
//!
//! The store-agnostic representation shared by both sides of a sync:
//! - Typed body blocks
//! - Tag sets
//! - Per-store native references and modification instants

mod types;

pub use types::{Block, BlockKind, CanonicalDocument, ItemKey, StoreId};
