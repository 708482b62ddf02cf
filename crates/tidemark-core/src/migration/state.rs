//! Migration records and their lifecycle.
//!
//! A migration moves `pending -> running -> completed | failed`. Terminal
//! states are final.

use super::error::MigrationError;
use super::spec::MigrationSpec;
use crate::context::Environment;
use crate::history::HistoryRecord;
use crate::operation::{OperationOutput, OperationType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    /// Created, not yet started.
    Pending,
    /// Executing hooks, backups or operations.
    Running,
    /// Every required operation succeeded.
    Completed,
    /// Stopped by a failure or cancellation.
    Failed,
}

impl MigrationStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationStatus::Completed | MigrationStatus::Failed)
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStatus::Pending => write!(f, "pending"),
            MigrationStatus::Running => write!(f, "running"),
            MigrationStatus::Completed => write!(f, "completed"),
            MigrationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
}

/// Result of one executed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    /// Position in the operation list.
    pub index: usize,
    /// Operation type.
    pub operation: OperationType,
    pub status: ResultStatus,
    /// Handler output on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OperationOutput>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl OperationResult {
    /// A successful result.
    pub fn success(index: usize, operation: OperationType, output: OperationOutput) -> Self {
        Self {
            index,
            operation,
            status: ResultStatus::Success,
            output: Some(output),
            error: None,
            completed_at: Utc::now(),
        }
    }

    /// A failed result.
    pub fn failure(index: usize, operation: OperationType, error: impl Into<String>) -> Self {
        Self {
            index,
            operation,
            status: ResultStatus::Error,
            output: None,
            error: Some(error.into()),
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

/// Backup taken before a migration's operations ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRef {
    pub table_name: String,
    pub backup_id: String,
}

/// One submitted migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Migration {
    /// Unique id assigned at submission.
    pub id: String,
    pub name: String,
    pub version: String,
    pub environment: Environment,
    pub region: String,
    pub status: MigrationStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Number of operations in the spec.
    pub operation_count: usize,
    /// One entry per attempted operation, in execution order.
    pub results: Vec<OperationResult>,
    /// Percentage of operations attempted.
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backups: Vec<BackupRef>,
    /// Non-fatal problems: validation advisories, post-hook failures.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Migration {
    /// Create a pending migration for `spec`.
    pub fn new(
        id: impl Into<String>,
        spec: &MigrationSpec,
        environment: Environment,
        region: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: spec.name.clone(),
            version: spec.version.clone(),
            environment,
            region: region.into(),
            status: MigrationStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            operation_count: spec.operations.len(),
            results: Vec::new(),
            progress: 0.0,
            backups: Vec::new(),
            warnings: Vec::new(),
            error: None,
        }
    }

    fn transition(&mut self, to: MigrationStatus) -> Result<(), MigrationError> {
        let allowed = match (self.status, to) {
            (MigrationStatus::Pending, MigrationStatus::Running) => true,
            (MigrationStatus::Running, MigrationStatus::Completed) => true,
            (from, MigrationStatus::Failed) => !from.is_terminal(),
            _ => false,
        };
        if !allowed {
            return Err(MigrationError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Enter `running`.
    pub fn start(&mut self) -> Result<(), MigrationError> {
        self.transition(MigrationStatus::Running)?;
        self.start_time = Utc::now();
        Ok(())
    }

    /// Append an operation result and recompute progress.
    pub fn record(&mut self, result: OperationResult) {
        self.results.push(result);
        self.recalculate_progress();
    }

    fn recalculate_progress(&mut self) {
        self.progress = if self.operation_count == 0 {
            100.0
        } else {
            (self.results.len() as f64 / self.operation_count as f64) * 100.0
        };
    }

    /// Enter `completed`.
    pub fn complete(&mut self) -> Result<(), MigrationError> {
        self.transition(MigrationStatus::Completed)?;
        self.end_time = Some(Utc::now());
        self.recalculate_progress();
        Ok(())
    }

    /// Enter `failed` with an error message.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), MigrationError> {
        self.transition(MigrationStatus::Failed)?;
        self.end_time = Some(Utc::now());
        self.error = Some(error.into());
        Ok(())
    }

    /// Number of operations that succeeded.
    pub fn successful_operation_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    /// Wall time from start to end, or to now while running.
    pub fn duration_ms(&self) -> u64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_milliseconds().max(0) as u64
    }

    /// Build the history record archived for this migration.
    pub fn to_history_record(&self) -> HistoryRecord {
        HistoryRecord {
            migration_id: self.id.clone(),
            applied_at: self.end_time.unwrap_or_else(Utc::now),
            name: self.name.clone(),
            version: self.version.clone(),
            status: self.status,
            environment: self.environment,
            region: self.region.clone(),
            duration_ms: self.duration_ms(),
            operation_count: self.operation_count,
            successful_operation_count: self.successful_operation_count(),
            error: self.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OutcomeStatus;

    fn migration(operations: usize) -> Migration {
        let mut spec = MigrationSpec::new("add-index", "1.0.0");
        for _ in 0..operations {
            spec.operations.push(crate::operation::OperationSpec::new(
                crate::operation::Operation::EnablePointInTimeRecovery(
                    crate::operation::EnablePointInTimeRecovery {
                        table_name: "users".into(),
                    },
                ),
            ));
        }
        Migration::new("m1", &spec, Environment::Development, "local")
    }

    #[test]
    fn test_lifecycle_and_progress() {
        let mut m = migration(4);
        m.start().unwrap();
        m.record(OperationResult::success(
            0,
            OperationType::EnablePointInTimeRecovery,
            OperationOutput::new(OutcomeStatus::Enabled),
        ));
        assert_eq!(m.progress, 25.0);
        m.record(OperationResult::failure(1, OperationType::EnablePointInTimeRecovery, "boom"));
        assert_eq!(m.progress, 50.0);
        assert_eq!(m.successful_operation_count(), 1);

        m.complete().unwrap();
        assert_eq!(m.status, MigrationStatus::Completed);
        assert!(m.end_time.is_some());
    }

    #[test]
    fn test_empty_migration_progress() {
        let mut m = migration(0);
        m.start().unwrap();
        m.complete().unwrap();
        assert_eq!(m.progress, 100.0);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut m = migration(1);
        m.start().unwrap();
        m.fail("boom").unwrap();
        assert!(matches!(
            m.complete(),
            Err(MigrationError::InvalidTransition { .. })
        ));
        assert!(m.fail("again").is_err());
        assert!(m.start().is_err());
        assert_eq!(m.status, MigrationStatus::Failed);
        assert_eq!(m.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_pending_cannot_complete() {
        let mut m = migration(1);
        assert!(m.complete().is_err());
    }

    #[test]
    fn test_history_record() {
        let mut m = migration(2);
        m.start().unwrap();
        m.record(OperationResult::success(
            0,
            OperationType::EnablePointInTimeRecovery,
            OperationOutput::new(OutcomeStatus::Enabled),
        ));
        m.fail("operation 1 failed").unwrap();

        let record = m.to_history_record();
        assert_eq!(record.migration_id, "m1");
        assert_eq!(record.status, MigrationStatus::Failed);
        assert_eq!(record.operation_count, 2);
        assert_eq!(record.successful_operation_count, 1);
        assert_eq!(Some(record.applied_at), m.end_time);
    }
}
