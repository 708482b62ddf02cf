//! Tidemark Core - migration orchestration for live key-value table stores.
//!
//! This crate provides the storage backend contract and its in-memory and
//! sled implementations, the operation registry, the sandboxed transform
//! expression language, and the migration manager with planning, risk
//! scoring, validation and history.

pub mod backend;
pub mod config;
pub mod context;
pub mod expr;
pub mod history;
pub mod migration;
pub mod operation;

pub use backend::{BackendError, Item, MemoryBackend, SledBackend, StorageBackend};
pub use config::EngineConfig;
pub use context::{CancellationToken, Environment, ExecutionContext};
pub use expr::{Expression, ExpressionError, ItemTransform};
pub use history::{
    BackendHistoryStore, HistoryError, HistoryRecord, HistoryStore, InFlightRecord,
    MemoryHistoryStore,
};
pub use migration::{
    Migration, MigrationError, MigrationHandle, MigrationManager, MigrationPlan, MigrationSpec,
    MigrationStatus, OperationResult, RiskLevel, StatusReport, SubmitRequest, SubmitResponse,
};
pub use operation::{
    Operation, OperationError, OperationOutput, OperationRegistry, OperationSpec, OperationType,
    OutcomeStatus, ProcessToolRunner, ToolRunner,
};
