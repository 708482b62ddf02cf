//! Migration specs as submitted by callers.

use super::error::MigrationError;
use crate::context::Environment;
use crate::operation::{OperationSpec, OperationType, ToolStep};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// A named, versioned list of operations to apply in order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSpec {
    #[serde(default)]
    pub name: String,

    /// Semantic version, `MAJOR.MINOR.PATCH`.
    #[serde(default)]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Operations, executed strictly in this order.
    #[serde(default)]
    pub operations: Vec<OperationSpec>,

    /// Tool steps run before any backup or operation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_hooks: Vec<ToolStep>,

    /// Tool steps run after every required operation succeeded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_hooks: Vec<ToolStep>,

    /// Back up every referenced table before executing.
    #[serde(default)]
    pub backup_required: bool,

    /// Environment the author intended; advisory only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,

    /// Operations that undo this migration. Shown in plans, never run automatically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<Vec<OperationSpec>>,
}

impl MigrationSpec {
    /// Create an empty spec.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    /// Append an operation.
    pub fn with_operation(mut self, operation: OperationSpec) -> Self {
        self.operations.push(operation);
        self
    }

    /// Require pre-execution backups.
    pub fn with_backup(mut self) -> Self {
        self.backup_required = true;
        self
    }

    /// Declare the rollback procedure.
    pub fn with_rollback(mut self, operations: Vec<OperationSpec>) -> Self {
        self.rollback = Some(operations);
        self
    }

    /// Parse a spec from JSON.
    ///
    /// Unlike plain deserialization this requires the `operations` field,
    /// reports unknown operation types as [`MigrationError::UnknownOperation`]
    /// and names the offending operation when a payload is malformed.
    pub fn from_json(json: &str) -> Result<Self, MigrationError> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| MigrationError::validation(format!("invalid JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Parse a spec from an already decoded JSON value. See [`MigrationSpec::from_json`].
    pub fn from_value(mut value: Value) -> Result<Self, MigrationError> {
        let Some(object) = value.as_object_mut() else {
            return Err(MigrationError::validation("spec must be a JSON object"));
        };

        let operations = match object.remove("operations") {
            Some(Value::Array(items)) => items,
            Some(_) => return Err(MigrationError::validation("operations must be an array")),
            None => return Err(MigrationError::validation("operations is required")),
        };
        let rollback = match object.remove("rollback") {
            Some(Value::Array(items)) => Some(items),
            Some(Value::Null) | None => None,
            Some(_) => return Err(MigrationError::validation("rollback must be an array")),
        };

        let mut spec: MigrationSpec = serde_json::from_value(value)
            .map_err(|e| MigrationError::validation(e.to_string()))?;
        spec.operations = parse_operations("operations", operations)?;
        spec.rollback = rollback
            .map(|items| parse_operations("rollback", items))
            .transpose()?;
        Ok(spec)
    }

    /// Every table referenced by an operation, deduplicated, in first-use order.
    pub fn referenced_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = Vec::new();
        for spec in &self.operations {
            for table in spec.operation.table_names() {
                if !table.is_empty() && !tables.iter().any(|t| t == table) {
                    tables.push(table.to_string());
                }
            }
        }
        tables
    }
}

fn parse_operations(field: &str, items: Vec<Value>) -> Result<Vec<OperationSpec>, MigrationError> {
    let mut errors = Vec::new();
    let mut operations = Vec::with_capacity(items.len());

    for (index, item) in items.into_iter().enumerate() {
        let tag = match item.get("type").and_then(Value::as_str) {
            Some(tag) => tag.to_string(),
            None => {
                errors.push(format!("{}[{}]: type is required", field, index));
                continue;
            }
        };
        if OperationType::from_str(&tag).is_err() {
            return Err(MigrationError::UnknownOperation { index, tag });
        }
        match serde_json::from_value::<OperationSpec>(item) {
            Ok(operation) => operations.push(operation),
            Err(e) => errors.push(format!("{}[{}] ({}): {}", field, index, tag, e)),
        }
    }

    if errors.is_empty() {
        Ok(operations)
    } else {
        Err(MigrationError::Validation { errors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_spec() {
        let spec = MigrationSpec::from_value(json!({
            "name": "add-email-index",
            "version": "1.2.0",
            "backupRequired": true,
            "environment": "production",
            "preHooks": [{"name": "announce", "tool": "echo", "args": ["start"]}],
            "operations": [
                {"type": "createGSI", "tableName": "users", "indexName": "by_email",
                 "keySchema": [{"attributeName": "email", "keyType": "HASH"}]},
                {"type": "migrateData", "sourceTable": "users", "targetTable": "users_v2",
                 "required": false}
            ],
            "rollback": [{"type": "deleteGSI", "tableName": "users", "indexName": "by_email"}]
        }))
        .unwrap();

        assert_eq!(spec.operations.len(), 2);
        assert!(!spec.operations[1].required);
        assert_eq!(spec.pre_hooks.len(), 1);
        assert_eq!(spec.environment, Some(Environment::Production));
        assert_eq!(spec.rollback.as_ref().map(Vec::len), Some(1));
        assert_eq!(spec.referenced_tables(), vec!["users", "users_v2"]);
    }

    #[test]
    fn test_missing_operations_is_rejected() {
        let err = MigrationSpec::from_json(r#"{"name": "x", "version": "1.0.0"}"#).unwrap_err();
        assert!(matches!(err, MigrationError::Validation { .. }));
    }

    #[test]
    fn test_empty_operations_parse() {
        let spec =
            MigrationSpec::from_json(r#"{"name": "x", "version": "1.0.0", "operations": []}"#)
                .unwrap();
        assert!(spec.operations.is_empty());
    }

    #[test]
    fn test_unknown_operation_type() {
        let err = MigrationSpec::from_value(json!({
            "name": "x",
            "version": "1.0.0",
            "operations": [
                {"type": "createTable", "tableName": "t",
                 "keySchema": [{"attributeName": "id", "keyType": "HASH"}],
                 "attributeDefinitions": [{"attributeName": "id", "attributeType": "S"}]},
                {"type": "truncateEverything", "tableName": "t"}
            ]
        }))
        .unwrap_err();
        assert!(matches!(
            err,
            MigrationError::UnknownOperation { index: 1, ref tag } if tag == "truncateEverything"
        ));
    }

    #[test]
    fn test_malformed_payload_names_operation() {
        let err = MigrationSpec::from_value(json!({
            "name": "x",
            "version": "1.0.0",
            "operations": [{"type": "deleteGSI", "tableName": "users"}, {"tableName": "users"}]
        }))
        .unwrap_err();
        let MigrationError::Validation { errors } = err else {
            panic!("expected validation error");
        };
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("operations[0] (deleteGSI)"));
        assert_eq!(errors[1], "operations[1]: type is required");
    }
}
