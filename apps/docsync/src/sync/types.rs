//! Sync task types
//!
//! A task is the coordinator's unit of work for one logical item. It moves
//! through a small state machine and ends in a terminal status that is
//! published to anyone holding a [`SyncTaskHandle`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::conflict::{Conflict, Resolution, ResolutionStrategy};
use crate::document::{ItemKey, StoreId};
use crate::error::{FailureReason, Result, SyncError};
use crate::events::ChangeEvent;

/// Which sides a task may write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Only the local side is written
    RemoteToLocal,
    /// Only the remote side is written
    LocalToRemote,
    Bidirectional,
}

impl Direction {
    pub fn allows_write(self, store: StoreId) -> bool {
        match self {
            Direction::RemoteToLocal => store == StoreId::Local,
            Direction::LocalToRemote => store == StoreId::Remote,
            Direction::Bidirectional => true,
        }
    }

    /// Side that drives the sync, used to attribute outcome events
    pub fn source(self) -> StoreId {
        match self {
            Direction::LocalToRemote => StoreId::Local,
            Direction::RemoteToLocal | Direction::Bidirectional => StoreId::Remote,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::RemoteToLocal => "remote_to_local",
            Direction::LocalToRemote => "local_to_remote",
            Direction::Bidirectional => "bidirectional",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = SyncError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "remote_to_local" | "a_to_b" | "pull" => Ok(Direction::RemoteToLocal),
            "local_to_remote" | "b_to_a" | "push" => Ok(Direction::LocalToRemote),
            "bidirectional" | "both" => Ok(Direction::Bidirectional),
            other => Err(SyncError::Rejected(format!("unknown direction: {}", other))),
        }
    }
}

/// Per-task state machine.
///
/// `Idle -> Fetching -> Resolving -> Applying -> Done`, with `Failed`
/// reachable from every active phase. A retry restarts at `Fetching` and
/// moves straight to `Applying` when it resumes writes left unfinished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Idle,
    Fetching,
    Resolving,
    Applying,
    Done,
    Failed,
}

impl TaskPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskPhase::Done | TaskPhase::Failed)
    }

    pub fn can_transition(self, to: TaskPhase) -> bool {
        use TaskPhase::*;
        match (self, to) {
            (Idle, Fetching) => true,
            (Fetching, Resolving) | (Fetching, Applying) | (Fetching, Done) => true,
            (Resolving, Applying) | (Resolving, Done) => true,
            (Applying, Done) => true,
            (Fetching | Resolving | Applying, Fetching) => true,
            (Fetching | Resolving | Applying, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskPhase::Idle => "idle",
            TaskPhase::Fetching => "fetching",
            TaskPhase::Resolving => "resolving",
            TaskPhase::Applying => "applying",
            TaskPhase::Done => "done",
            TaskPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of sync work for one item
#[derive(Debug, Clone, Serialize)]
pub struct SyncTask {
    pub id: String,
    #[serde(rename = "itemKey")]
    pub item_key: ItemKey,
    pub direction: Direction,
    /// Store whose change produced this task; `None` for manual syncs
    pub origin: Option<StoreId>,
    /// Applied to every conflicting field instead of the configured strategy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ResolutionStrategy>,
    pub phase: TaskPhase,
    pub attempt: u32,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    /// Resolved once identity lookup succeeds
    #[serde(rename = "logicalId", skip_serializing_if = "Option::is_none")]
    pub logical_id: Option<String>,
}

impl SyncTask {
    pub fn new(item_key: ItemKey, direction: Direction) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            item_key,
            direction,
            origin: None,
            strategy: None,
            phase: TaskPhase::Idle,
            attempt: 0,
            created_at: Utc::now(),
            logical_id: None,
        }
    }

    /// Event-derived tasks may write either side
    pub fn from_event(event: &ChangeEvent) -> Self {
        let mut task = Self::new(event.item_key.clone(), Direction::Bidirectional);
        task.origin = Some(event.store);
        task
    }

    pub fn with_strategy(mut self, strategy: Option<ResolutionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn transition(&mut self, to: TaskPhase) -> Result<()> {
        if !self.phase.can_transition(to) {
            return Err(SyncError::InvalidTransition {
                from: self.phase.to_string(),
                to: to.to_string(),
            });
        }
        self.phase = to;
        Ok(())
    }

    /// Store credited with the task in outcome events
    pub fn source_store(&self) -> StoreId {
        self.origin.unwrap_or_else(|| self.direction.source())
    }

    /// Key used in outcome events: the logical id once known
    pub fn outcome_key(&self) -> ItemKey {
        match &self.logical_id {
            Some(id) => ItemKey::logical(id.clone()),
            None => self.item_key.clone(),
        }
    }
}

/// What a successful task did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Neither side changed since the last sync
    NoOp,
    /// Both sides changed to the same content; bookkeeping only
    InSync,
    /// One side changed and was copied to the other
    Propagated { from: StoreId, written: Vec<StoreId> },
    /// Both sides changed; conflicts were resolved automatically
    Resolved { conflicts: usize, written: Vec<StoreId> },
    /// A previously synced side no longer exists; nothing is resurrected
    SourceMissing { store: StoreId },
}

impl SyncOutcome {
    pub(crate) fn with_written(self, stores: Vec<StoreId>) -> Self {
        match self {
            SyncOutcome::Propagated { from, .. } => SyncOutcome::Propagated {
                from,
                written: stores,
            },
            SyncOutcome::Resolved { conflicts, .. } => SyncOutcome::Resolved {
                conflicts,
                written: stores,
            },
            other => other,
        }
    }

    pub fn written(&self) -> &[StoreId] {
        match self {
            SyncOutcome::Propagated { written, .. } | SyncOutcome::Resolved { written, .. } => {
                written
            }
            _ => &[],
        }
    }
}

/// Externally visible task status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress { phase: TaskPhase, attempt: u32 },
    Succeeded { outcome: SyncOutcome },
    Failed { reason: FailureReason, message: String },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded { .. } | TaskStatus::Failed { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Succeeded { .. })
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            TaskStatus::Failed { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// Caller's view of a submitted task
#[derive(Debug, Clone)]
pub struct SyncTaskHandle {
    task_id: String,
    item_key: ItemKey,
    status: watch::Receiver<TaskStatus>,
}

impl SyncTaskHandle {
    pub(crate) fn new(task: &SyncTask, status: watch::Receiver<TaskStatus>) -> Self {
        Self {
            task_id: task.id.clone(),
            item_key: task.item_key.clone(),
            status,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn item_key(&self) -> &ItemKey {
        &self.item_key
    }

    pub fn status(&self) -> TaskStatus {
        self.status.borrow().clone()
    }

    /// Wait for the terminal status
    pub async fn wait(mut self) -> TaskStatus {
        loop {
            {
                let status = self.status.borrow_and_update();
                if status.is_terminal() {
                    return status.clone();
                }
            }
            if self.status.changed().await.is_err() {
                // Sender dropped; the last published status is final
                return self.status.borrow().clone();
            }
        }
    }
}

/// Archived failed task
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(rename = "itemKey")]
    pub item_key: ItemKey,
    pub direction: Direction,
    pub attempts: u32,
    pub reason: FailureReason,
    pub message: String,
    #[serde(rename = "finishedAt")]
    pub finished_at: DateTime<Utc>,
}

/// Conflicts waiting for a human decision
#[derive(Debug, Clone, Serialize)]
pub struct PendingDecision {
    #[serde(rename = "itemId")]
    pub item_id: String,
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub conflicts: Vec<Conflict>,
    pub resolutions: Vec<Resolution>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Coordinator status report
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    #[serde(rename = "successCount")]
    pub success_count: u64,
    /// Queued events plus coalesced events waiting on an in-flight item
    #[serde(rename = "pendingCount")]
    pub pending_count: usize,
    /// Failures excluding pending decisions
    #[serde(rename = "errorCount")]
    pub error_count: u64,
    #[serde(rename = "lastSyncTime")]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(rename = "inProgress")]
    pub in_progress: usize,
    #[serde(rename = "pendingDecisions")]
    pub pending_decisions: usize,
    #[serde(rename = "recentFailures")]
    pub recent_failures: Vec<TaskRecord>,
}
