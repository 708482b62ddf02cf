//! Migration engine error types.

use super::state::MigrationStatus;
use crate::backend::BackendError;
use crate::history::HistoryError;
use crate::operation::{OperationError, OperationType};
use thiserror::Error;

/// Which hook list failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    /// Before any operation runs.
    Pre,
    /// After every required operation succeeded.
    Post,
}

impl std::fmt::Display for HookStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookStage::Pre => write!(f, "pre-hook"),
            HookStage::Post => write!(f, "post-hook"),
        }
    }
}

/// Errors surfaced by the migration engine.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The spec failed blocking validation. Nothing was created.
    #[error("validation failed: {}", errors.join("; "))]
    Validation {
        /// Every blocking problem found.
        errors: Vec<String>,
    },

    /// The concurrency ceiling is reached. Nothing was created.
    #[error("too many running migrations: {running} running, limit is {limit}")]
    Capacity {
        /// Migrations currently running.
        running: usize,
        /// Configured ceiling.
        limit: usize,
    },

    /// An operation carries a type tag the registry does not know.
    #[error("unknown operation type '{tag}' at operations[{index}]")]
    UnknownOperation {
        /// Position in the operation list.
        index: usize,
        /// The unrecognized tag.
        tag: String,
    },

    /// A required operation failed.
    #[error("operation {index} ({operation}) failed: {source}")]
    OperationExecution {
        /// Position in the operation list.
        index: usize,
        /// Operation type.
        operation: OperationType,
        /// Handler failure.
        #[source]
        source: OperationError,
    },

    /// A required hook step failed.
    #[error("{stage} failed: {source}")]
    Hook {
        /// Which hooks were running.
        stage: HookStage,
        /// Step failure.
        #[source]
        source: OperationError,
    },

    /// The pre-execution backup of a table failed.
    #[error("backup of table {table} failed: {source}")]
    Backup {
        /// Table being backed up.
        table: String,
        /// Backend failure.
        #[source]
        source: BackendError,
    },

    /// The migration was cancelled.
    #[error("migration cancelled")]
    Cancelled,

    /// No migration with this id is known.
    #[error("migration not found: {0}")]
    NotFound(String),

    /// A status change would leave a terminal state or skip a state.
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: MigrationStatus,
        /// Requested status.
        to: MigrationStatus,
    },

    /// Storage backend failure outside an operation.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// History store failure.
    #[error("history error: {0}")]
    History(#[from] HistoryError),

    /// Spec or record encoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The migration task panicked or was aborted.
    #[error("migration task failed: {0}")]
    TaskFailed(String),
}

impl MigrationError {
    /// Build a validation error from a single message.
    pub fn validation(message: impl Into<String>) -> Self {
        MigrationError::Validation {
            errors: vec![message.into()],
        }
    }

    /// The handler error behind an operation or hook failure.
    pub fn operation_error(&self) -> Option<&OperationError> {
        match self {
            MigrationError::OperationExecution { source, .. } => Some(source),
            MigrationError::Hook { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_joins_errors() {
        let err = MigrationError::Validation {
            errors: vec!["name is required".into(), "version must be MAJOR.MINOR.PATCH".into()],
        };
        assert_eq!(
            err.to_string(),
            "validation failed: name is required; version must be MAJOR.MINOR.PATCH"
        );
    }

    #[test]
    fn test_operation_error_access() {
        let err = MigrationError::OperationExecution {
            index: 2,
            operation: OperationType::DeleteTable,
            source: OperationError::ConfirmationRequired {
                table: "users".into(),
            },
        };
        assert!(err.to_string().starts_with("operation 2 (deleteTable) failed"));
        assert!(matches!(
            err.operation_error(),
            Some(OperationError::ConfirmationRequired { .. })
        ));
        assert!(MigrationError::Cancelled.operation_error().is_none());
    }
}
