//! CLI error types.

use std::path::PathBuf;
use thiserror::Error;
use tidemark_core::{BackendError, MigrationError, MigrationStatus};

/// Errors that end a CLI invocation with a non-zero exit code.
#[derive(Debug, Error)]
pub enum CliError {
    /// A spec file could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The spec has blocking problems.
    #[error("spec is invalid: {}", errors.join("; "))]
    Invalid { errors: Vec<String> },

    /// The migration ran and did not complete.
    #[error("migration {id} finished as {status}: {error}")]
    Failed {
        id: String,
        status: MigrationStatus,
        error: String,
    },

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("storage error: {0}")]
    Backend(#[from] BackendError),

    #[error("output encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}
