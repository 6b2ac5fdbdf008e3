//! Change-event bus
//!
//! Decouples change producers (file watchers, remote pollers) from the
//! sync coordinator.
//!
//! # Ordering
//!
//! - Strict priority order, higher numeric priority first
//! - FIFO by enqueue time among equal priorities
//!
//! # Delivery
//!
//! Handlers registered for an event type run in registration order. A
//! failing handler is logged and skipped; an event with no handler is
//! logged as a warning and dropped.

mod bus;
mod types;

pub use bus::{BusConfig, EventBus, EventHandler};
pub use types::{
    ChangeEvent, DispatchReport, EmitOutcome, EventKind, EventStats, EventType, HandlerError,
    HandlerId, PRIORITY_CHANGE, PRIORITY_LOWEST, PRIORITY_SYNC_COMPLETE, PRIORITY_SYNC_ERROR,
};
