//! Table lifecycle handlers.

use super::{OperationError, OperationOutput, OperationRegistry, OutcomeStatus};
use crate::backend::{
    BackendError, BillingMode, StreamSpecification, StreamViewType, TableDefinition,
    TableDescription, TableUpdate,
};
use crate::context::ExecutionContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

/// Payload of `modifyTable`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyTable {
    pub table_name: String,
    /// Applied in order. A failure does not undo earlier modifications.
    pub modifications: Vec<TableModification>,
}

/// One settings change applied by `modifyTable`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TableModification {
    /// Switch billing mode.
    #[serde(rename_all = "camelCase")]
    BillingMode { billing_mode: BillingMode },
    /// Turn the change stream on or off.
    #[serde(rename_all = "camelCase")]
    Stream {
        enabled: bool,
        #[serde(default)]
        view_type: Option<StreamViewType>,
    },
    /// Turn point-in-time recovery on or off.
    #[serde(rename_all = "camelCase")]
    PointInTimeRecovery { enabled: bool },
}

impl TableModification {
    fn label(&self) -> &'static str {
        match self {
            TableModification::BillingMode { .. } => "billingMode",
            TableModification::Stream { .. } => "stream",
            TableModification::PointInTimeRecovery { .. } => "pointInTimeRecovery",
        }
    }
}

/// Payload of `deleteTable`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteTable {
    pub table_name: String,
    /// Must equal `DELETE-<tableName>-CONFIRMED` in production.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<String>,
}

impl DeleteTable {
    /// The confirmation token production deletes must carry.
    pub fn expected_confirmation(&self) -> String {
        format!("DELETE-{}-CONFIRMED", self.table_name)
    }

    /// Whether the carried token matches [`Self::expected_confirmation`].
    pub fn is_confirmed(&self) -> bool {
        self.confirmation.as_deref() == Some(self.expected_confirmation().as_str())
    }
}

impl OperationRegistry {
    pub(crate) async fn create_table(
        &self,
        definition: &TableDefinition,
        ctx: &ExecutionContext,
    ) -> Result<OperationOutput, OperationError> {
        let name = definition.table_name.as_str();
        if self.backend.describe_table(name).await?.is_some() {
            tracing::info!(migration_id = %ctx.migration_id, table = %name, "table exists, skipping create");
            return Ok(OperationOutput::new(OutcomeStatus::Skipped)
                .with("tableName", name)
                .with("reason", "table already exists"));
        }

        self.backend.create_table(definition).await?;
        let description = self.wait_for_active(name, ctx).await?;

        Ok(OperationOutput::new(OutcomeStatus::Created)
            .with("tableName", name)
            .with("globalSecondaryIndexes", description.global_secondary_indexes.len()))
    }

    /// Poll until the table is active, bounded by the configured timeout.
    pub(crate) async fn wait_for_active(
        &self,
        table_name: &str,
        ctx: &ExecutionContext,
    ) -> Result<TableDescription, OperationError> {
        let started = Instant::now();
        let deadline = started + self.settings.table_active_timeout;

        loop {
            if ctx.is_cancelled() {
                return Err(OperationError::Cancelled);
            }

            match self.backend.describe_table(table_name).await? {
                Some(description) if description.is_active() => return Ok(description),
                Some(description) => {
                    tracing::debug!(
                        migration_id = %ctx.migration_id,
                        table = %table_name,
                        status = ?description.status,
                        "waiting for table to become active"
                    );
                }
                None => return Err(BackendError::TableNotFound(table_name.to_string()).into()),
            }

            if Instant::now() >= deadline {
                return Err(OperationError::Timeout {
                    table: table_name.to_string(),
                    waited: started.elapsed(),
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.table_poll_interval) => {}
                _ = ctx.cancel.cancelled() => return Err(OperationError::Cancelled),
            }
        }
    }

    pub(crate) async fn modify_table(
        &self,
        payload: &ModifyTable,
        ctx: &ExecutionContext,
    ) -> Result<OperationOutput, OperationError> {
        let table = payload.table_name.as_str();
        let mut applied = Vec::with_capacity(payload.modifications.len());

        for (position, modification) in payload.modifications.iter().enumerate() {
            if ctx.is_cancelled() {
                return Err(OperationError::Cancelled);
            }

            let result = match modification {
                TableModification::BillingMode { billing_mode } => {
                    self.backend
                        .update_table(table, &TableUpdate::BillingMode(*billing_mode))
                        .await
                }
                TableModification::Stream { enabled, view_type } => {
                    let stream = StreamSpecification {
                        enabled: *enabled,
                        view_type: if *enabled {
                            Some(view_type.unwrap_or_default())
                        } else {
                            None
                        },
                    };
                    self.backend
                        .update_table(table, &TableUpdate::Stream(stream))
                        .await
                }
                TableModification::PointInTimeRecovery { enabled } => {
                    self.backend.set_point_in_time_recovery(table, *enabled).await
                }
            };

            if let Err(source) = result {
                tracing::warn!(
                    migration_id = %ctx.migration_id,
                    table = %table,
                    applied = applied.len(),
                    error = %source,
                    "table modification failed"
                );
                return Err(OperationError::ModificationFailed {
                    table: table.to_string(),
                    failed: position,
                    source,
                });
            }
            applied.push(Value::from(modification.label()));
        }

        Ok(OperationOutput::new(OutcomeStatus::Updated)
            .with("tableName", table)
            .with("applied", applied))
    }

    pub(crate) async fn delete_table(
        &self,
        payload: &DeleteTable,
        ctx: &ExecutionContext,
    ) -> Result<OperationOutput, OperationError> {
        let table = payload.table_name.as_str();
        if ctx.environment.is_production() && !payload.is_confirmed() {
            return Err(OperationError::ConfirmationRequired {
                table: table.to_string(),
            });
        }

        if self.backend.describe_table(table).await?.is_none() {
            return Ok(OperationOutput::new(OutcomeStatus::Skipped)
                .with("tableName", table)
                .with("reason", "table does not exist"));
        }

        self.backend.delete_table(table).await?;
        tracing::info!(migration_id = %ctx.migration_id, table = %table, "table deleted");
        Ok(OperationOutput::new(OutcomeStatus::Deleted).with("tableName", table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        AttributeDefinition, AttributeType, KeySchemaElement, MemoryBackend, StorageBackend,
    };
    use crate::config::EngineConfig;
    use crate::context::Environment;
    use crate::operation::{Operation, ProcessToolRunner};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn definition(name: &str) -> TableDefinition {
        TableDefinition {
            table_name: name.to_string(),
            key_schema: vec![KeySchemaElement::hash("id")],
            attribute_definitions: vec![AttributeDefinition::new("id", AttributeType::String)],
            global_secondary_indexes: Vec::new(),
            local_secondary_indexes: Vec::new(),
            billing_mode: BillingMode::PayPerRequest,
            stream: None,
            tags: BTreeMap::new(),
        }
    }

    fn registry(backend: Arc<MemoryBackend>, config: EngineConfig) -> OperationRegistry {
        OperationRegistry::new(backend, Arc::new(ProcessToolRunner::new()), &config)
    }

    fn ctx(environment: Environment) -> ExecutionContext {
        ExecutionContext::new("m-test", environment, "local")
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_table_polls_until_active() {
        let backend = Arc::new(MemoryBackend::new().with_activation_delay(3));
        let registry = registry(backend.clone(), EngineConfig::default());

        let output = registry
            .execute(&Operation::CreateTable(definition("users")), &ctx(Environment::Development))
            .await
            .unwrap();
        assert_eq!(output.status, OutcomeStatus::Created);

        let again = registry
            .execute(&Operation::CreateTable(definition("users")), &ctx(Environment::Development))
            .await
            .unwrap();
        assert_eq!(again.status, OutcomeStatus::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_table_times_out() {
        let backend = Arc::new(MemoryBackend::new().with_activation_delay(u32::MAX));
        let config = EngineConfig::default()
            .with_table_active_timeout(Duration::from_secs(10))
            .with_table_poll_interval(Duration::from_secs(2));
        let registry = registry(backend, config);

        let err = registry
            .execute(&Operation::CreateTable(definition("users")), &ctx(Environment::Development))
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Timeout { ref table, .. } if table == "users"));
    }

    #[tokio::test]
    async fn test_delete_requires_confirmation_in_production() {
        let backend = Arc::new(MemoryBackend::new());
        backend.create_table(&definition("users")).await.unwrap();
        let registry = registry(backend.clone(), EngineConfig::default());
        let calls_before = backend.call_count();

        let unconfirmed = Operation::DeleteTable(DeleteTable {
            table_name: "users".to_string(),
            confirmation: Some("yes".to_string()),
        });
        let err = registry
            .execute(&unconfirmed, &ctx(Environment::Production))
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::ConfirmationRequired { .. }));
        assert_eq!(backend.call_count(), calls_before);

        let confirmed = Operation::DeleteTable(DeleteTable {
            table_name: "users".to_string(),
            confirmation: Some("DELETE-users-CONFIRMED".to_string()),
        });
        let output = registry
            .execute(&confirmed, &ctx(Environment::Production))
            .await
            .unwrap();
        assert_eq!(output.status, OutcomeStatus::Deleted);
        assert!(backend.table_names().is_empty());
    }

    #[tokio::test]
    async fn test_delete_without_confirmation_outside_production() {
        let backend = Arc::new(MemoryBackend::new());
        backend.create_table(&definition("users")).await.unwrap();
        let registry = registry(backend.clone(), EngineConfig::default());

        let op = Operation::DeleteTable(DeleteTable {
            table_name: "users".to_string(),
            confirmation: None,
        });
        let output = registry.execute(&op, &ctx(Environment::Staging)).await.unwrap();
        assert_eq!(output.status, OutcomeStatus::Deleted);

        let output = registry.execute(&op, &ctx(Environment::Staging)).await.unwrap();
        assert_eq!(output.status, OutcomeStatus::Skipped);
    }

    #[tokio::test]
    async fn test_modify_table_keeps_earlier_changes_on_failure() {
        let backend = Arc::new(MemoryBackend::new());
        backend.create_table(&definition("users")).await.unwrap();
        let registry = registry(backend.clone(), EngineConfig::default());

        let op = Operation::ModifyTable(ModifyTable {
            table_name: "users".to_string(),
            modifications: vec![
                TableModification::PointInTimeRecovery { enabled: true },
                TableModification::Stream {
                    enabled: true,
                    view_type: None,
                },
            ],
        });
        let output = registry.execute(&op, &ctx(Environment::Development)).await.unwrap();
        assert_eq!(output.status, OutcomeStatus::Updated);

        let description = backend.describe_table("users").await.unwrap().unwrap();
        assert!(description.point_in_time_recovery);
        assert_eq!(
            description.stream.and_then(|s| s.view_type),
            Some(StreamViewType::NewAndOldImages)
        );

        let missing = Operation::ModifyTable(ModifyTable {
            table_name: "ghost".to_string(),
            modifications: vec![TableModification::PointInTimeRecovery { enabled: true }],
        });
        let err = registry
            .execute(&missing, &ctx(Environment::Development))
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::ModificationFailed { failed: 0, .. }));
    }
}
