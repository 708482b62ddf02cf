//! Operation handler errors.

use crate::backend::BackendError;
use crate::expr::ExpressionError;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a single operation handler.
#[derive(Debug, Error)]
pub enum OperationError {
    /// Backend call failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Destructive operation in production without the confirmation token.
    #[error("deleting table {table} in production requires confirmation 'DELETE-{table}-CONFIRMED'")]
    ConfirmationRequired {
        /// Table that would have been deleted.
        table: String,
    },

    /// Table did not become active in time.
    #[error("table {table} did not become active within {waited:?}")]
    Timeout {
        /// Table being waited on.
        table: String,
        /// How long the handler waited.
        waited: Duration,
    },

    /// A sub-modification failed after earlier ones were applied.
    #[error("modification #{failed} on table {table} failed, earlier modifications stay applied: {source}")]
    ModificationFailed {
        /// Table being modified.
        table: String,
        /// Index of the failing modification, which is also the number applied.
        failed: usize,
        /// Backend failure.
        #[source]
        source: BackendError,
    },

    /// Transform or filter expression failed to parse.
    #[error("invalid expression: {0}")]
    Expression(#[from] ExpressionError),

    /// A required tool step failed.
    #[error("tool step '{step}' failed: {message}")]
    ToolFailed {
        /// Step name.
        step: String,
        /// Failure description.
        message: String,
    },

    /// The migration was cancelled while the handler ran.
    #[error("operation cancelled")]
    Cancelled,

    /// The payload is inconsistent in a way parsing could not catch.
    #[error("invalid operation payload: {0}")]
    InvalidPayload(String),
}

impl OperationError {
    /// Whether the error was caused by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, OperationError::Cancelled)
    }
}
