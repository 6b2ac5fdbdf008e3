//! Error types for the docsync engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::StoreId;

/// Engine-wide result type
pub type Result<T> = std::result::Result<T, SyncError>;

/// Sync engine error type
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or filesystem hiccup; retried with backoff
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// A collaborator call did not finish within the configured timeout
    #[error("{operation} timed out after {millis} ms")]
    Timeout { operation: &'static str, millis: u64 },

    #[error("Conversion error: {0}")]
    Conversion(#[from] ConversionError),

    /// A conflict strategy asked for a human decision
    #[error("Conflict on {item} requires user input ({conflicts} field(s))")]
    ConflictUnresolved { item: String, conflicts: usize },

    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(String),

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    /// A native id is already bound to a different logical item
    #[error("{store} id {native_id} is bound to {existing}, refusing to rebind to {requested}")]
    IdentityConflict {
        store: StoreId,
        native_id: String,
        existing: String,
        requested: String,
    },

    #[error("Store rejected write: {0}")]
    Rejected(String),

    #[error("Invalid task transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Event bus is closed")]
    BusClosed,
}

impl SyncError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientIo(_) | SyncError::Timeout { .. })
    }
}

/// Errors raised by a [`crate::store::StoreClient`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Transient store error: {0}")]
    Transient(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rejected: {0}")]
    Rejected(String),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Transient(msg) => SyncError::TransientIo(msg),
            StoreError::NotFound(id) => SyncError::ItemNotFound(id),
            StoreError::Rejected(msg) => SyncError::Rejected(msg),
        }
    }
}

/// Errors raised by a [`crate::store::Converter`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error("Malformed {store} item {native_id}: {message}")]
    Malformed {
        store: StoreId,
        native_id: String,
        message: String,
    },

    #[error("Unsupported content: {0}")]
    Unsupported(String),
}

/// Terminal classification recorded on a failed task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "kebab-case")]
pub enum FailureReason {
    NeedsUserInput { conflicts: usize },
    ConversionError { message: String },
    TransientIoExhausted { attempts: u32, message: String },
    LockTimeout,
    IdentityConflict { message: String },
    ItemNotFound { message: String },
    Rejected { message: String },
    Internal { message: String },
}

impl FailureReason {
    /// Stable code used in events and status reports
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::NeedsUserInput { .. } => "needs-user-input",
            FailureReason::ConversionError { .. } => "conversion-error",
            FailureReason::TransientIoExhausted { .. } => "transient-io-exhausted",
            FailureReason::LockTimeout => "lock-timeout",
            FailureReason::IdentityConflict { .. } => "identity-conflict",
            FailureReason::ItemNotFound { .. } => "item-not-found",
            FailureReason::Rejected { .. } => "rejected",
            FailureReason::Internal { .. } => "internal",
        }
    }

    /// Pending decisions are surfaced separately and not counted as errors
    pub fn is_error(&self) -> bool {
        !matches!(self, FailureReason::NeedsUserInput { .. })
    }

    /// Classify an error that escaped a task after `attempts` tries
    pub fn from_error(err: &SyncError, attempts: u32) -> Self {
        match err {
            SyncError::TransientIo(_) | SyncError::Timeout { .. } => {
                FailureReason::TransientIoExhausted {
                    attempts,
                    message: err.to_string(),
                }
            }
            SyncError::Conversion(e) => FailureReason::ConversionError {
                message: e.to_string(),
            },
            SyncError::ConflictUnresolved { conflicts, .. } => FailureReason::NeedsUserInput {
                conflicts: *conflicts,
            },
            SyncError::LockTimeout(_) => FailureReason::LockTimeout,
            SyncError::IdentityConflict { .. } => FailureReason::IdentityConflict {
                message: err.to_string(),
            },
            SyncError::ItemNotFound(_) => FailureReason::ItemNotFound {
                message: err.to_string(),
            },
            SyncError::Rejected(_) => FailureReason::Rejected {
                message: err.to_string(),
            },
            SyncError::InvalidTransition { .. } | SyncError::BusClosed => {
                FailureReason::Internal {
                    message: err.to_string(),
                }
            }
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::TransientIo("reset".into()).is_retryable());
        assert!(SyncError::Timeout {
            operation: "fetch",
            millis: 10
        }
        .is_retryable());
        assert!(!SyncError::Conversion(ConversionError::Unsupported("x".into())).is_retryable());
        assert!(!SyncError::LockTimeout("doc-1".into()).is_retryable());
    }

    #[test]
    fn test_store_error_maps_to_taxonomy() {
        let err: SyncError = StoreError::Transient("503".into()).into();
        assert!(matches!(err, SyncError::TransientIo(_)));

        let err: SyncError = StoreError::NotFound("page-1".into()).into();
        assert!(matches!(err, SyncError::ItemNotFound(_)));
    }

    #[test]
    fn test_failure_reason_codes() {
        let err = SyncError::ConflictUnresolved {
            item: "doc-1".into(),
            conflicts: 2,
        };
        let reason = FailureReason::from_error(&err, 1);
        assert_eq!(reason.code(), "needs-user-input");
        assert!(!reason.is_error());

        let reason = FailureReason::from_error(&SyncError::TransientIo("eof".into()), 3);
        assert_eq!(reason.code(), "transient-io-exhausted");
        assert!(reason.is_error());

        let json = serde_json::to_value(&FailureReason::LockTimeout).unwrap();
        assert_eq!(json["code"], "lock-timeout");
    }
}
