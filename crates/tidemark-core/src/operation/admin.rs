//! Single-call table administration handlers.

use super::{OperationError, OperationOutput, OperationRegistry, OutcomeStatus};
use crate::backend::{EncryptionSettings, StreamSpecification, StreamViewType, TableUpdate};
use crate::context::ExecutionContext;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Payload of `createBackup`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBackup {
    pub table_name: String,
    /// Defaults to `<tableName>-<migrationId>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_name: Option<String>,
}

/// Payload of `restoreBackup`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreBackup {
    pub backup_id: String,
    pub target_table_name: String,
}

/// Payload of `enableStreams`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnableStreams {
    pub table_name: String,
    #[serde(default)]
    pub view_type: StreamViewType,
}

/// Payload of `enablePointInTimeRecovery`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnablePointInTimeRecovery {
    pub table_name: String,
}

/// Payload of `addTags`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddTags {
    pub table_name: String,
    pub tags: BTreeMap<String, String>,
}

/// Payload of `enableEncryption`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnableEncryption {
    pub table_name: String,
    /// Customer managed key; the store-owned key when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms_key_id: Option<String>,
}

impl OperationRegistry {
    pub(crate) async fn create_backup(
        &self,
        payload: &CreateBackup,
        ctx: &ExecutionContext,
    ) -> Result<OperationOutput, OperationError> {
        let name = payload
            .backup_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", payload.table_name, ctx.migration_id));
        let backup = self.backend.create_backup(&payload.table_name, &name).await?;

        tracing::info!(
            migration_id = %ctx.migration_id,
            table = %payload.table_name,
            backup_id = %backup.backup_id,
            "backup created"
        );
        Ok(OperationOutput::new(OutcomeStatus::BackedUp)
            .with("tableName", payload.table_name.as_str())
            .with("backupId", backup.backup_id)
            .with("backupName", backup.backup_name)
            .with("itemCount", backup.item_count))
    }

    pub(crate) async fn restore_backup(
        &self,
        payload: &RestoreBackup,
        ctx: &ExecutionContext,
    ) -> Result<OperationOutput, OperationError> {
        let target = payload.target_table_name.as_str();
        if self.backend.describe_table(target).await?.is_some() {
            return Ok(OperationOutput::new(OutcomeStatus::Skipped)
                .with("tableName", target)
                .with("reason", "target table already exists"));
        }

        self.backend.restore_backup(&payload.backup_id, target).await?;
        tracing::info!(
            migration_id = %ctx.migration_id,
            backup_id = %payload.backup_id,
            table = %target,
            "backup restored"
        );
        Ok(OperationOutput::new(OutcomeStatus::Restored)
            .with("tableName", target)
            .with("backupId", payload.backup_id.as_str()))
    }

    pub(crate) async fn enable_streams(
        &self,
        payload: &EnableStreams,
        _ctx: &ExecutionContext,
    ) -> Result<OperationOutput, OperationError> {
        let stream = StreamSpecification {
            enabled: true,
            view_type: Some(payload.view_type),
        };
        self.backend
            .update_table(&payload.table_name, &TableUpdate::Stream(stream))
            .await?;
        Ok(OperationOutput::new(OutcomeStatus::Enabled)
            .with("tableName", payload.table_name.as_str())
            .with("feature", "streams"))
    }

    pub(crate) async fn enable_point_in_time_recovery(
        &self,
        payload: &EnablePointInTimeRecovery,
        _ctx: &ExecutionContext,
    ) -> Result<OperationOutput, OperationError> {
        self.backend
            .set_point_in_time_recovery(&payload.table_name, true)
            .await?;
        Ok(OperationOutput::new(OutcomeStatus::Enabled)
            .with("tableName", payload.table_name.as_str())
            .with("feature", "pointInTimeRecovery"))
    }

    pub(crate) async fn add_tags(
        &self,
        payload: &AddTags,
        _ctx: &ExecutionContext,
    ) -> Result<OperationOutput, OperationError> {
        self.backend.tag_table(&payload.table_name, &payload.tags).await?;
        Ok(OperationOutput::new(OutcomeStatus::Tagged)
            .with("tableName", payload.table_name.as_str())
            .with("tagCount", payload.tags.len()))
    }

    pub(crate) async fn enable_encryption(
        &self,
        payload: &EnableEncryption,
        _ctx: &ExecutionContext,
    ) -> Result<OperationOutput, OperationError> {
        let settings = EncryptionSettings {
            kms_key_id: payload.kms_key_id.clone(),
        };
        self.backend
            .update_table(&payload.table_name, &TableUpdate::Encryption(settings))
            .await?;
        Ok(OperationOutput::new(OutcomeStatus::Enabled)
            .with("tableName", payload.table_name.as_str())
            .with("feature", "encryption"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        AttributeDefinition, AttributeType, BillingMode, KeySchemaElement, MemoryBackend,
        StorageBackend, TableDefinition,
    };
    use crate::config::EngineConfig;
    use crate::context::Environment;
    use crate::operation::{Operation, ProcessToolRunner};
    use serde_json::json;
    use std::sync::Arc;

    async fn setup() -> (Arc<MemoryBackend>, OperationRegistry) {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .create_table(&TableDefinition {
                table_name: "orders".to_string(),
                key_schema: vec![KeySchemaElement::hash("id")],
                attribute_definitions: vec![AttributeDefinition::new("id", AttributeType::String)],
                global_secondary_indexes: Vec::new(),
                local_secondary_indexes: Vec::new(),
                billing_mode: BillingMode::PayPerRequest,
                stream: None,
                tags: BTreeMap::new(),
            })
            .await
            .unwrap();
        let registry = OperationRegistry::new(
            backend.clone(),
            Arc::new(ProcessToolRunner::new()),
            &EngineConfig::default(),
        );
        (backend, registry)
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("m42", Environment::Development, "local")
    }

    #[tokio::test]
    async fn test_backup_and_restore() {
        let (backend, registry) = setup().await;

        let backup = registry
            .execute(
                &Operation::CreateBackup(CreateBackup {
                    table_name: "orders".to_string(),
                    backup_name: None,
                }),
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(backup.status, OutcomeStatus::BackedUp);
        assert_eq!(backup.detail("backupName"), Some(&json!("orders-m42")));
        let backup_id = backup.detail("backupId").unwrap().as_str().unwrap().to_string();

        let restore = Operation::RestoreBackup(RestoreBackup {
            backup_id,
            target_table_name: "orders_restored".to_string(),
        });
        let output = registry.execute(&restore, &ctx()).await.unwrap();
        assert_eq!(output.status, OutcomeStatus::Restored);
        assert!(backend.table_names().contains(&"orders_restored".to_string()));

        let output = registry.execute(&restore, &ctx()).await.unwrap();
        assert_eq!(output.status, OutcomeStatus::Skipped);
    }

    #[tokio::test]
    async fn test_feature_toggles() {
        let (backend, registry) = setup().await;
        let ops = [
            Operation::EnableStreams(EnableStreams {
                table_name: "orders".to_string(),
                view_type: StreamViewType::NewImage,
            }),
            Operation::EnablePointInTimeRecovery(EnablePointInTimeRecovery {
                table_name: "orders".to_string(),
            }),
            Operation::AddTags(AddTags {
                table_name: "orders".to_string(),
                tags: BTreeMap::from([("team".to_string(), "billing".to_string())]),
            }),
            Operation::EnableEncryption(EnableEncryption {
                table_name: "orders".to_string(),
                kms_key_id: Some("key-1".to_string()),
            }),
        ];
        for op in &ops {
            registry.execute(op, &ctx()).await.unwrap();
        }

        let description = backend.describe_table("orders").await.unwrap().unwrap();
        assert_eq!(
            description.stream.and_then(|s| s.view_type),
            Some(StreamViewType::NewImage)
        );
        assert!(description.point_in_time_recovery);
        assert_eq!(description.tags.get("team").map(String::as_str), Some("billing"));
        assert_eq!(
            description.encryption.and_then(|e| e.kms_key_id).as_deref(),
            Some("key-1")
        );
    }
}
