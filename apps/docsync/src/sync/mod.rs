//! Sync engine
//!
//! The coordinator consumes store change events, serializes work per
//! logical item, and applies resolved documents to whichever side is stale.
//!
//! # Task lifecycle
//!
//! ```text
//! Idle -> Fetching -> Resolving -> Applying -> Done
//!            \            \            \
//!             +------------+------------+--> Failed
//! ```
//!
//! A conflict that needs a human decision fails the task with
//! `needs-user-input` and is listed as a pending decision, never applied.

mod coordinator;
mod ledger;
mod locks;
mod poller;
mod types;

pub use coordinator::SyncCoordinator;
pub use ledger::{LedgerEntry, LedgerSnapshot, SyncLedger};
pub use locks::{ItemLockGuard, ItemLocks};
pub use poller::ChangePoller;
pub use crate::error::Result;
pub use types::{
    Direction, PendingDecision, SyncOutcome, SyncStatus, SyncTask, SyncTaskHandle, TaskPhase,
    TaskRecord, TaskStatus,
};
