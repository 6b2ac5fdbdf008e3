//! Docsync
//!
//! Keeps a remote structured document store and a local plain-file store
//! mutually consistent without a shared transaction log.
//!
//! # Modules
//!
//! - `events`: priority event bus between change producers and the engine
//! - `sync`: coordinator, identity ledger, per-item locks, change poller
//! - `conflict`: field-level conflict detection and resolution strategies
//! - `document`: canonical document model shared by both stores
//! - `store`: store client and converter interfaces, in-memory reference store

pub mod config;
pub mod conflict;
pub mod document;
pub mod error;
pub mod events;
pub mod store;
pub mod sync;
pub mod telemetry;

pub use config::{Config, EngineConfig};
pub use conflict::{ConflictResolver, ResolutionStrategy};
pub use document::{Block, BlockKind, CanonicalDocument, ItemKey, StoreId};
pub use error::{ConversionError, FailureReason, Result, StoreError, SyncError};
pub use events::{ChangeEvent, EventBus, EventKind, EventType};
pub use store::{Converter, NativeItem, StoreClient, StoreEndpoint, StorePair};
pub use sync::{Direction, SyncCoordinator, SyncStatus, SyncTaskHandle, TaskStatus};
