//! Migration manager - admits, runs and archives migrations.
//!
//! Each admitted migration runs on its own tokio task. Operations within a
//! migration run strictly in order; migrations are independent of each
//! other apart from the concurrency ceiling.
//!
//! The active set is the only shared mutable state. The capacity check and
//! the insertion of a new migration happen under one lock acquisition, so
//! the ceiling cannot be overshot by racing submissions.

use super::error::{HookStage, MigrationError};
use super::plan::{MigrationPlan, Planner};
use super::spec::MigrationSpec;
use super::state::{BackupRef, Migration, MigrationStatus, OperationResult};
use super::validate::validate;
use crate::backend::StorageBackend;
use crate::config::EngineConfig;
use crate::context::{CancellationToken, Environment, ExecutionContext};
use crate::history::{
    BackendHistoryStore, HistoryError, HistoryRecord, HistoryStore, InFlightRecord,
};
use crate::operation::{OperationError, OperationRegistry, ToolRunner, ToolStep};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A submission as received from a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub spec: MigrationSpec,
    pub environment: Environment,
    #[serde(default)]
    pub dry_run: bool,
}

/// What a submission produced.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "result", rename_all = "camelCase")]
pub enum SubmitResponse {
    /// The migration ran to a terminal status.
    Executed(Migration),
    /// Dry run: nothing was executed.
    Planned(MigrationPlan),
}

/// Handle to a spawned migration.
#[derive(Debug)]
pub struct MigrationHandle {
    id: String,
    join: JoinHandle<Migration>,
}

impl MigrationHandle {
    /// Id of the migration.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the migration to reach a terminal status.
    pub async fn wait(self) -> Result<Migration, MigrationError> {
        self.join
            .await
            .map_err(|e| MigrationError::TaskFailed(e.to_string()))
    }
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", content = "migration", rename_all = "camelCase")]
pub enum StatusReport {
    /// Running, or finished recently in this process; carries every result.
    Live(Migration),
    /// Known only from the history store.
    Archived(HistoryRecord),
}

impl StatusReport {
    /// Status of the migration.
    pub fn status(&self) -> MigrationStatus {
        match self {
            StatusReport::Live(migration) => migration.status,
            StatusReport::Archived(record) => record.status,
        }
    }

    /// The live snapshot, if the migration is still held in memory.
    pub fn live(&self) -> Option<&Migration> {
        match self {
            StatusReport::Live(migration) => Some(migration),
            StatusReport::Archived(_) => None,
        }
    }
}

struct ActiveEntry {
    migration: Migration,
    cancel: CancellationToken,
}

/// Finished migrations kept for status queries, oldest evicted first.
struct RecentlyFinished {
    capacity: usize,
    order: VecDeque<String>,
    migrations: HashMap<String, Migration>,
}

impl RecentlyFinished {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            migrations: HashMap::new(),
        }
    }

    fn insert(&mut self, migration: Migration) {
        if self.capacity == 0 {
            return;
        }
        let id = migration.id.clone();
        if self.migrations.insert(id.clone(), migration).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.migrations.remove(&oldest);
            }
        }
    }

    fn get(&self, id: &str) -> Option<&Migration> {
        self.migrations.get(id)
    }

    fn len(&self) -> usize {
        self.migrations.len()
    }
}

struct ManagerInner {
    registry: OperationRegistry,
    history: Arc<dyn HistoryStore>,
    config: EngineConfig,
    planner: Planner,
    active: Mutex<HashMap<String, ActiveEntry>>,
    finished: Mutex<RecentlyFinished>,
}

/// Orchestrates migrations against one storage backend.
///
/// Cloning is cheap; clones share the active set and history store.
#[derive(Clone)]
pub struct MigrationManager {
    inner: Arc<ManagerInner>,
}

impl MigrationManager {
    /// Create a manager.
    pub fn new(
        registry: OperationRegistry,
        history: Arc<dyn HistoryStore>,
        config: EngineConfig,
    ) -> Self {
        let planner = Planner::new(config.default_step_estimate);
        let finished = RecentlyFinished::new(config.finished_retention);
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                history,
                config,
                planner,
                active: Mutex::new(HashMap::new()),
                finished: Mutex::new(finished),
            }),
        }
    }

    /// Create a manager whose history lives in the backend itself.
    pub async fn open(
        backend: Arc<dyn StorageBackend>,
        tools: Arc<dyn ToolRunner>,
        config: EngineConfig,
    ) -> Result<Self, MigrationError> {
        let history = BackendHistoryStore::open(Arc::clone(&backend), &config).await?;
        let registry = OperationRegistry::new(backend, tools, &config);
        Ok(Self::new(registry, Arc::new(history), config))
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Validate, admit and start a migration, returning without waiting.
    ///
    /// Fails with [`MigrationError::Validation`] or
    /// [`MigrationError::Capacity`]; in both cases nothing is created.
    pub fn spawn(
        &self,
        spec: MigrationSpec,
        environment: Environment,
    ) -> Result<MigrationHandle, MigrationError> {
        let warnings = validate(&spec, environment).into_result()?;

        let id = Uuid::new_v4().to_string();
        let mut migration = Migration::new(&id, &spec, environment, &self.inner.config.region);
        migration.warnings = warnings;
        migration.start()?;
        let cancel = CancellationToken::new();

        {
            let mut active = self.inner.active.lock();
            let limit = self.inner.config.max_concurrent_migrations;
            if active.len() >= limit {
                return Err(MigrationError::Capacity {
                    running: active.len(),
                    limit,
                });
            }
            active.insert(
                id.clone(),
                ActiveEntry {
                    migration: migration.clone(),
                    cancel: cancel.clone(),
                },
            );
        }

        info!(
            migration_id = %id,
            name = %spec.name,
            version = %spec.version,
            environment = %environment,
            operations = spec.operations.len(),
            "Migration submitted"
        );

        let inner = Arc::clone(&self.inner);
        let join = tokio::spawn(async move { inner.run(spec, migration, cancel).await });
        Ok(MigrationHandle { id, join })
    }

    /// Submit a migration and wait for its terminal status.
    ///
    /// An operation failure is not an `Err`: the returned migration is
    /// `failed` with the error attached.
    pub async fn submit(
        &self,
        spec: MigrationSpec,
        environment: Environment,
    ) -> Result<Migration, MigrationError> {
        self.spawn(spec, environment)?.wait().await
    }

    /// Plan a migration without executing anything.
    pub fn dry_run(
        &self,
        spec: &MigrationSpec,
        environment: Environment,
    ) -> Result<MigrationPlan, MigrationError> {
        let warnings = validate(spec, environment).into_result()?;
        Ok(self.inner.planner.plan(spec, environment, warnings))
    }

    /// Submission interface: execute or plan depending on `dry_run`.
    pub async fn handle(&self, request: SubmitRequest) -> Result<SubmitResponse, MigrationError> {
        if request.dry_run {
            return self
                .dry_run(&request.spec, request.environment)
                .map(SubmitResponse::Planned);
        }
        self.submit(request.spec, request.environment)
            .await
            .map(SubmitResponse::Executed)
    }

    /// Ask a running migration to stop.
    ///
    /// Returns `false` if the migration already finished, including
    /// migrations only known from history.
    pub async fn cancel(&self, id: &str) -> Result<bool, MigrationError> {
        let signalled = match self.inner.active.lock().get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        };
        if signalled {
            info!(migration_id = %id, "Migration cancellation requested");
            return Ok(true);
        }
        if self.snapshot(id).is_some() {
            return Ok(false);
        }
        self.history_record(id).await.map(|_| false)
    }

    /// Status of a migration: the live snapshot while it is running or
    /// recently finished, the history record otherwise.
    pub async fn get_status(&self, id: &str) -> Result<StatusReport, MigrationError> {
        if let Some(migration) = self.snapshot(id) {
            return Ok(StatusReport::Live(migration));
        }
        self.history_record(id).await.map(StatusReport::Archived)
    }

    fn snapshot(&self, id: &str) -> Option<Migration> {
        if let Some(entry) = self.inner.active.lock().get(id) {
            return Some(entry.migration.clone());
        }
        self.inner.finished.lock().get(id).cloned()
    }

    /// Number of finished migrations held in memory.
    pub fn retained_count(&self) -> usize {
        self.inner.finished.lock().len()
    }

    /// Snapshots of every running migration.
    pub fn list_active(&self) -> Vec<Migration> {
        let mut migrations: Vec<Migration> = self
            .inner
            .active
            .lock()
            .values()
            .map(|entry| entry.migration.clone())
            .collect();
        migrations.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        migrations
    }

    /// Number of running migrations.
    pub fn running_count(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// Archived record of one migration, including those of earlier processes.
    pub async fn history_record(&self, id: &str) -> Result<HistoryRecord, MigrationError> {
        self.inner
            .history
            .get(id)
            .await?
            .ok_or_else(|| MigrationError::NotFound(id.to_string()))
    }

    /// Most recent history records first, at most `limit`.
    pub async fn list_history(
        &self,
        limit: usize,
        environment: Option<Environment>,
    ) -> Result<Vec<HistoryRecord>, MigrationError> {
        Ok(self.inner.history.list(limit, environment).await?)
    }

    /// Archive migrations left in flight by a previous process as failed.
    ///
    /// Index builds those migrations issued keep running server-side; their
    /// state has to be re-checked with a follow-up migration.
    pub async fn recover(&self) -> Result<Vec<HistoryRecord>, MigrationError> {
        let markers = self.inner.history.list_in_flight().await?;
        let mut archived = Vec::new();

        for marker in markers {
            if self.inner.active.lock().contains_key(&marker.migration_id) {
                continue;
            }
            let id = marker.migration_id.clone();
            let record = marker.into_interrupted(Utc::now());
            match self.inner.history.append(&record).await {
                Ok(()) => {
                    warn!(migration_id = %id, name = %record.name, "Archived interrupted migration as failed");
                    archived.push(record);
                }
                Err(HistoryError::Conflict(_)) => {
                    debug!(migration_id = %id, "Interrupted migration already archived");
                }
                Err(e) => return Err(e.into()),
            }
            self.inner.history.clear_in_flight(&id).await?;
        }

        Ok(archived)
    }
}

impl ManagerInner {
    async fn run(
        self: Arc<Self>,
        spec: MigrationSpec,
        mut migration: Migration,
        cancel: CancellationToken,
    ) -> Migration {
        let ctx = ExecutionContext::new(&migration.id, migration.environment, &migration.region)
            .with_cancellation(cancel);

        let marker = InFlightRecord {
            migration_id: migration.id.clone(),
            name: migration.name.clone(),
            version: migration.version.clone(),
            environment: migration.environment,
            region: migration.region.clone(),
            started_at: migration.start_time,
            operation_count: migration.operation_count,
        };
        if let Err(e) = self.history.mark_in_flight(&marker).await {
            error!(migration_id = %migration.id, error = %e, "Failed to write in-flight marker");
        }

        let outcome = self.execute(&spec, &mut migration, &ctx).await;
        let transition = match &outcome {
            Ok(()) => migration.complete(),
            Err(e) => migration.fail(e.to_string()),
        };
        if let Err(e) = transition {
            error!(migration_id = %migration.id, error = %e, "Failed to finalize migration status");
        }

        self.finish(migration).await
    }

    async fn execute(
        &self,
        spec: &MigrationSpec,
        migration: &mut Migration,
        ctx: &ExecutionContext,
    ) -> Result<(), MigrationError> {
        if !spec.pre_hooks.is_empty() {
            let failed = self.run_hooks(&spec.pre_hooks, ctx).await.map_err(|source| {
                if source.is_cancelled() {
                    MigrationError::Cancelled
                } else {
                    MigrationError::Hook {
                        stage: HookStage::Pre,
                        source,
                    }
                }
            })?;
            migration.warnings.extend(
                failed
                    .into_iter()
                    .map(|step| format!("optional pre-hook step '{}' failed", step)),
            );
        }

        if spec.backup_required || ctx.environment.is_production() {
            self.back_up(spec, migration, ctx).await?;
            self.publish(migration);
        }

        for (index, op) in spec.operations.iter().enumerate() {
            let kind = op.kind();
            match self.registry.execute(&op.operation, ctx).await {
                Ok(output) => {
                    debug!(migration_id = %ctx.migration_id, index, operation = %kind, status = %output.status, "Operation succeeded");
                    migration.record(OperationResult::success(index, kind, output));
                }
                Err(source) => {
                    migration.record(OperationResult::failure(index, kind, source.to_string()));
                    if source.is_cancelled() {
                        self.publish(migration);
                        return Err(MigrationError::Cancelled);
                    }
                    if op.required {
                        self.publish(migration);
                        return Err(MigrationError::OperationExecution {
                            index,
                            operation: kind,
                            source,
                        });
                    }
                    warn!(
                        migration_id = %ctx.migration_id,
                        index,
                        operation = %kind,
                        error = %source,
                        "Optional operation failed, continuing"
                    );
                }
            }
            self.publish(migration);
        }

        if !spec.post_hooks.is_empty() {
            match self.run_hooks(&spec.post_hooks, ctx).await {
                Ok(failed) => migration.warnings.extend(
                    failed
                        .into_iter()
                        .map(|step| format!("optional post-hook step '{}' failed", step)),
                ),
                Err(source) => {
                    let err = MigrationError::Hook {
                        stage: HookStage::Post,
                        source,
                    };
                    warn!(migration_id = %ctx.migration_id, error = %err, "Post-hook failed");
                    migration.warnings.push(err.to_string());
                }
            }
        }

        Ok(())
    }

    /// Run hook steps, returning the names of failed optional steps.
    async fn run_hooks(
        &self,
        steps: &[ToolStep],
        ctx: &ExecutionContext,
    ) -> Result<Vec<String>, OperationError> {
        let report = self
            .registry
            .run_tool_steps(steps, &BTreeMap::new(), ctx)
            .await?;
        Ok(report.failed_optional)
    }

    async fn back_up(
        &self,
        spec: &MigrationSpec,
        migration: &mut Migration,
        ctx: &ExecutionContext,
    ) -> Result<(), MigrationError> {
        let backend = self.registry.backend();
        for table in spec.referenced_tables() {
            if ctx.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }
            let exists = backend
                .describe_table(&table)
                .await
                .map_err(|source| MigrationError::Backup {
                    table: table.clone(),
                    source,
                })?
                .is_some();
            if !exists {
                debug!(migration_id = %ctx.migration_id, table = %table, "Table does not exist yet, skipping backup");
                continue;
            }

            let name = format!("{}-pre-{}", table, ctx.migration_id);
            let backup = backend
                .create_backup(&table, &name)
                .await
                .map_err(|source| MigrationError::Backup {
                    table: table.clone(),
                    source,
                })?;
            info!(
                migration_id = %ctx.migration_id,
                table = %table,
                backup_id = %backup.backup_id,
                "Pre-migration backup created"
            );
            migration.backups.push(BackupRef {
                table_name: table,
                backup_id: backup.backup_id,
            });
        }
        Ok(())
    }

    /// Make the latest snapshot visible to status queries.
    fn publish(&self, migration: &Migration) {
        if let Some(entry) = self.active.lock().get_mut(&migration.id) {
            entry.migration = migration.clone();
        }
    }

    /// Archive a terminal migration. The id stays in the active set until
    /// its history record is written and its in-flight marker cleared.
    async fn finish(&self, migration: Migration) -> Migration {
        self.publish(&migration);

        let record = migration.to_history_record();
        if let Err(e) = self.history.append(&record).await {
            error!(migration_id = %migration.id, error = %e, "Failed to append history record");
        } else if let Err(e) = self.history.clear_in_flight(&migration.id).await {
            error!(migration_id = %migration.id, error = %e, "Failed to clear in-flight marker");
        }

        {
            let mut active = self.active.lock();
            let mut finished = self.finished.lock();
            active.remove(&migration.id);
            finished.insert(migration.clone());
        }

        match &migration.error {
            None => info!(
                migration_id = %migration.id,
                duration_ms = record.duration_ms,
                operations = migration.operation_count,
                "Migration completed"
            ),
            Some(error) => info!(
                migration_id = %migration.id,
                duration_ms = record.duration_ms,
                succeeded = record.successful_operation_count,
                error = %error,
                "Migration failed"
            ),
        }
        migration
    }
}
