//! Operation dispatch.

use super::toolchain::ToolRunner;
use super::{Operation, OperationError, OperationOutput};
use crate::backend::StorageBackend;
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use std::sync::Arc;
use std::time::Duration;

/// Handler tuning taken from [`EngineConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HandlerSettings {
    pub table_active_timeout: Duration,
    pub table_poll_interval: Duration,
    pub scan_page_size: usize,
}

/// Executes operations against a storage backend.
///
/// The registry is immutable after construction and can be shared by any
/// number of concurrently running migrations.
pub struct OperationRegistry {
    pub(crate) backend: Arc<dyn StorageBackend>,
    pub(crate) tools: Arc<dyn ToolRunner>,
    pub(crate) settings: HandlerSettings,
}

impl OperationRegistry {
    /// Create a registry.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        tools: Arc<dyn ToolRunner>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            backend,
            tools,
            settings: HandlerSettings {
                table_active_timeout: config.table_active_timeout,
                table_poll_interval: config.table_poll_interval,
                scan_page_size: config.scan_page_size.max(1),
            },
        }
    }

    /// The backend handlers run against.
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Run one operation.
    pub async fn execute(
        &self,
        operation: &Operation,
        ctx: &ExecutionContext,
    ) -> Result<OperationOutput, OperationError> {
        if ctx.is_cancelled() {
            return Err(OperationError::Cancelled);
        }

        tracing::debug!(
            migration_id = %ctx.migration_id,
            operation = %operation.kind(),
            "executing operation"
        );

        match operation {
            Operation::CreateTable(definition) => self.create_table(definition, ctx).await,
            Operation::ModifyTable(payload) => self.modify_table(payload, ctx).await,
            Operation::DeleteTable(payload) => self.delete_table(payload, ctx).await,
            Operation::CreateGsi(payload) => self.create_index(payload, ctx).await,
            Operation::DeleteGsi(payload) => self.delete_index(payload, ctx).await,
            Operation::MigrateData(payload) => self.migrate_data(payload, ctx).await,
            Operation::TransformData(payload) => self.transform_data(payload, ctx).await,
            Operation::SeedData(payload) => self.seed_data(payload, ctx).await,
            Operation::CreateBackup(payload) => self.create_backup(payload, ctx).await,
            Operation::RestoreBackup(payload) => self.restore_backup(payload, ctx).await,
            Operation::EnableStreams(payload) => self.enable_streams(payload, ctx).await,
            Operation::EnablePointInTimeRecovery(payload) => {
                self.enable_point_in_time_recovery(payload, ctx).await
            }
            Operation::AddTags(payload) => self.add_tags(payload, ctx).await,
            Operation::EnableEncryption(payload) => self.enable_encryption(payload, ctx).await,
            Operation::CustomScript(chain) | Operation::ToolChain(chain) => {
                self.run_tool_chain(chain, ctx).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::context::Environment;
    use crate::operation::{EnablePointInTimeRecovery, ProcessToolRunner};

    #[tokio::test]
    async fn test_cancelled_context_skips_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let registry = OperationRegistry::new(
            backend.clone(),
            Arc::new(ProcessToolRunner::new()),
            &EngineConfig::default(),
        );
        let ctx = ExecutionContext::new("m1", Environment::Development, "local");
        ctx.cancel.cancel();

        let op = Operation::EnablePointInTimeRecovery(EnablePointInTimeRecovery {
            table_name: "users".to_string(),
        });
        let err = registry.execute(&op, &ctx).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(backend.call_count(), 0);
    }
}
