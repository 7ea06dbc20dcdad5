// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for wipline-core.
//!
//! Provides a unified error type shared by the executor, scheduler, signal
//! store and row lock.

use thiserror::Error;
use uuid::Uuid;

/// Result type using CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while scheduling or executing tasks.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Task was not found in the store.
    #[error("task '{task_id}' not found")]
    TaskNotFound {
        /// The task ID that was not found.
        task_id: Uuid,
    },

    /// A task with the same work ID is already waiting or processing.
    #[error("a task holding work id '{work_id}' is already active")]
    WorkIdConflict {
        /// The contested work ID.
        work_id: String,
    },

    /// The named concurrency group does not exist.
    #[error("concurrency group '{group}' not found")]
    GroupNotFound {
        /// The missing group name.
        group: String,
    },

    /// The task names a state that does not exist in its table.
    #[error("state '{state}' is not part of table '{wip_name}'")]
    UnknownState {
        /// The missing state.
        state: String,
        /// The table the task runs against.
        wip_name: String,
    },

    /// No workflow definition is registered under this name.
    #[error("no workflow definition registered for '{wip_name}'")]
    UnknownWip {
        /// The unregistered definition name.
        wip_name: String,
    },

    /// A state's action name has no handler bound in the registry.
    #[error("action '{action}' declared by the table has no bound handler")]
    ActionNotBound {
        /// The unbound action name.
        action: String,
    },

    /// The lock could not be acquired within the configured wait.
    #[error("timed out acquiring lock '{name}' after {waited_ms}ms")]
    LockTimeout {
        /// Lock name.
        name: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The lock was lost to TTL expiry before the critical section finished.
    #[error("lock '{name}' was lost to another owner before release")]
    LockConflict {
        /// Lock name.
        name: String,
    },

    /// Input validation failed.
    #[error("validation error for '{field}': {message}")]
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    #[error("database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Machine-readable error code for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::WorkIdConflict { .. } => "WORK_ID_CONFLICT",
            Self::GroupNotFound { .. } => "GROUP_NOT_FOUND",
            Self::UnknownState { .. } => "UNKNOWN_STATE",
            Self::UnknownWip { .. } => "UNKNOWN_WIP",
            Self::ActionNotBound { .. } => "ACTION_NOT_BOUND",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::LockConflict { .. } => "LOCK_CONFLICT",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases: Vec<(CoreError, &str)> = vec![
            (
                CoreError::TaskNotFound {
                    task_id: Uuid::nil(),
                },
                "TASK_NOT_FOUND",
            ),
            (
                CoreError::WorkIdConflict {
                    work_id: "x".to_string(),
                },
                "WORK_ID_CONFLICT",
            ),
            (
                CoreError::LockTimeout {
                    name: "pause".to_string(),
                    waited_ms: 100,
                },
                "LOCK_TIMEOUT",
            ),
            (
                CoreError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "boom".to_string(),
                },
                "DATABASE_ERROR",
            ),
        ];
        for (err, code) in cases {
            assert_eq!(err.error_code(), code);
            assert!(!err.to_string().is_empty());
        }
    }

    #[test]
    fn test_display_mentions_identifiers() {
        let err = CoreError::WorkIdConflict {
            work_id: "deploy:web-1".to_string(),
        };
        assert!(err.to_string().contains("deploy:web-1"));
    }
}
