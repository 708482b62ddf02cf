//! Global secondary index handlers.
//!
//! Index builds run server-side. Both handlers issue the request and return
//! the backend's reported state without polling.

use super::{OperationError, OperationOutput, OperationRegistry, OutcomeStatus};
use crate::backend::{
    AttributeDefinition, IndexDefinition, IndexStatus, IndexUpdate, KeySchemaElement, Projection,
};
use crate::context::ExecutionContext;
use serde::{Deserialize, Serialize};

/// Payload of `createGSI`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIndex {
    pub table_name: String,
    pub index_name: String,
    pub key_schema: Vec<KeySchemaElement>,
    #[serde(default)]
    pub projection: Projection,
    /// Types of key attributes not yet declared on the table.
    #[serde(default)]
    pub attribute_definitions: Vec<AttributeDefinition>,
}

/// Payload of `deleteGSI`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteIndex {
    pub table_name: String,
    pub index_name: String,
}

fn outcome(status: IndexStatus) -> OutcomeStatus {
    match status {
        IndexStatus::Creating => OutcomeStatus::Creating,
        IndexStatus::Deleting => OutcomeStatus::Deleting,
        IndexStatus::Updating => OutcomeStatus::Updated,
        IndexStatus::Active => OutcomeStatus::Created,
    }
}

impl OperationRegistry {
    pub(crate) async fn create_index(
        &self,
        payload: &CreateIndex,
        ctx: &ExecutionContext,
    ) -> Result<OperationOutput, OperationError> {
        let update = IndexUpdate::Create {
            index: IndexDefinition {
                index_name: payload.index_name.clone(),
                key_schema: payload.key_schema.clone(),
                projection: payload.projection.clone(),
            },
            attribute_definitions: payload.attribute_definitions.clone(),
        };
        let status = self.backend.update_index(&payload.table_name, &update).await?;

        tracing::info!(
            migration_id = %ctx.migration_id,
            table = %payload.table_name,
            index = %payload.index_name,
            status = %status,
            "index creation requested"
        );
        Ok(OperationOutput::new(outcome(status))
            .with("tableName", payload.table_name.as_str())
            .with("indexName", payload.index_name.as_str()))
    }

    pub(crate) async fn delete_index(
        &self,
        payload: &DeleteIndex,
        ctx: &ExecutionContext,
    ) -> Result<OperationOutput, OperationError> {
        let update = IndexUpdate::Delete {
            index_name: payload.index_name.clone(),
        };
        let status = self.backend.update_index(&payload.table_name, &update).await?;

        tracing::info!(
            migration_id = %ctx.migration_id,
            table = %payload.table_name,
            index = %payload.index_name,
            status = %status,
            "index deletion requested"
        );
        Ok(OperationOutput::new(outcome(status))
            .with("tableName", payload.table_name.as_str())
            .with("indexName", payload.index_name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        AttributeType, BillingMode, MemoryBackend, StorageBackend, TableDefinition,
    };
    use crate::config::EngineConfig;
    use crate::context::Environment;
    use crate::operation::{Operation, ProcessToolRunner};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    async fn setup() -> (Arc<MemoryBackend>, OperationRegistry) {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .create_table(&TableDefinition {
                table_name: "users".to_string(),
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

    #[tokio::test]
    async fn test_create_then_delete_index() {
        let (backend, registry) = setup().await;
        let ctx = ExecutionContext::new("m1", Environment::Development, "local");

        let create = Operation::CreateGsi(CreateIndex {
            table_name: "users".to_string(),
            index_name: "by_email".to_string(),
            key_schema: vec![KeySchemaElement::hash("email")],
            projection: Projection::default(),
            attribute_definitions: vec![AttributeDefinition::new("email", AttributeType::String)],
        });
        let output = registry.execute(&create, &ctx).await.unwrap();
        assert_eq!(output.status, OutcomeStatus::Creating);
        assert_eq!(output.detail("indexName").unwrap(), "by_email");

        let description = backend.describe_table("users").await.unwrap().unwrap();
        assert!(description.global_index("by_email").is_some());

        let delete = Operation::DeleteGsi(DeleteIndex {
            table_name: "users".to_string(),
            index_name: "by_email".to_string(),
        });
        let output = registry.execute(&delete, &ctx).await.unwrap();
        assert_eq!(output.status, OutcomeStatus::Deleting);
    }

    #[tokio::test]
    async fn test_delete_unknown_index_fails() {
        let (_backend, registry) = setup().await;
        let ctx = ExecutionContext::new("m1", Environment::Development, "local");
        let delete = Operation::DeleteGsi(DeleteIndex {
            table_name: "users".to_string(),
            index_name: "missing".to_string(),
        });
        assert!(matches!(
            registry.execute(&delete, &ctx).await,
            Err(OperationError::Backend(_))
        ));
    }
}
