//! Storage backend contract.
//!
//! The engine never talks to a concrete store directly. Every table
//! lifecycle call, scan, batched write and backup goes through the
//! [`StorageBackend`] trait, and every call is an `.await` point so one
//! migration waiting on the store never blocks another.
//!
//! Two implementations ship with the crate:
//! - [`MemoryBackend`]: process-local tables with fault injection, used by tests
//! - [`SledBackend`]: tables persisted as sled trees in a local directory

pub mod error;
pub mod local;
pub mod memory;

pub use error::BackendError;
pub use local::SledBackend;
pub use memory::MemoryBackend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A stored item: a JSON object keyed by attribute name.
pub type Item = serde_json::Map<String, Value>;

/// Maximum number of items accepted by one [`StorageBackend::batch_write`] call.
pub const MAX_BATCH_WRITE_ITEMS: usize = 25;

/// Role of an attribute in a key schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyType {
    /// Partition key.
    Hash,
    /// Sort key.
    Range,
}

/// One element of a table or index key schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySchemaElement {
    /// Attribute name.
    pub attribute_name: String,
    /// Key role.
    pub key_type: KeyType,
}

impl KeySchemaElement {
    /// Partition key element.
    pub fn hash(attribute_name: impl Into<String>) -> Self {
        Self {
            attribute_name: attribute_name.into(),
            key_type: KeyType::Hash,
        }
    }

    /// Sort key element.
    pub fn range(attribute_name: impl Into<String>) -> Self {
        Self {
            attribute_name: attribute_name.into(),
            key_type: KeyType::Range,
        }
    }
}

/// Scalar type of a key attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeType {
    /// String.
    #[serde(rename = "S")]
    String,
    /// Number.
    #[serde(rename = "N")]
    Number,
    /// Binary.
    #[serde(rename = "B")]
    Binary,
}

/// Declared type of an attribute used in a key schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDefinition {
    /// Attribute name.
    pub attribute_name: String,
    /// Attribute type.
    pub attribute_type: AttributeType,
}

impl AttributeDefinition {
    /// Create an attribute definition.
    pub fn new(attribute_name: impl Into<String>, attribute_type: AttributeType) -> Self {
        Self {
            attribute_name: attribute_name.into(),
            attribute_type,
        }
    }
}

/// Which attributes are copied into a secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectionType {
    /// Every attribute.
    #[default]
    All,
    /// Only key attributes.
    KeysOnly,
    /// Key attributes plus `non_key_attributes`.
    Include,
}

/// Secondary index projection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Projection {
    /// Projection type.
    #[serde(default)]
    pub projection_type: ProjectionType,
    /// Extra attributes for [`ProjectionType::Include`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_key_attributes: Vec<String>,
}

/// Definition of a global or local secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDefinition {
    /// Index name.
    pub index_name: String,
    /// Index key schema.
    pub key_schema: Vec<KeySchemaElement>,
    /// Projected attributes.
    #[serde(default)]
    pub projection: Projection,
}

/// Capacity billing for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingMode {
    /// On-demand capacity.
    #[default]
    PayPerRequest,
    /// Fixed provisioned throughput.
    #[serde(rename_all = "camelCase")]
    Provisioned {
        /// Read capacity units.
        read_capacity_units: u64,
        /// Write capacity units.
        write_capacity_units: u64,
    },
}

/// What a change stream record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamViewType {
    /// Only key attributes.
    KeysOnly,
    /// Item after modification.
    NewImage,
    /// Item before modification.
    OldImage,
    /// Both images.
    #[default]
    NewAndOldImages,
}

/// Change stream settings for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSpecification {
    /// Whether the stream is enabled.
    pub enabled: bool,
    /// Stream record contents when enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_type: Option<StreamViewType>,
}

/// Server-side encryption settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionSettings {
    /// Customer managed key, or `None` for the store-owned key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms_key_id: Option<String>,
}

/// Everything needed to create a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDefinition {
    /// Table name.
    pub table_name: String,
    /// Primary key schema.
    pub key_schema: Vec<KeySchemaElement>,
    /// Types of every attribute used in a key schema.
    pub attribute_definitions: Vec<AttributeDefinition>,
    /// Global secondary indexes.
    #[serde(default)]
    pub global_secondary_indexes: Vec<IndexDefinition>,
    /// Local secondary indexes.
    #[serde(default)]
    pub local_secondary_indexes: Vec<IndexDefinition>,
    /// Billing mode.
    #[serde(default)]
    pub billing_mode: BillingMode,
    /// Change stream.
    #[serde(default)]
    pub stream: Option<StreamSpecification>,
    /// Resource tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Lifecycle state of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableStatus {
    /// Being created.
    Creating,
    /// Settings are being changed.
    Updating,
    /// Being deleted.
    Deleting,
    /// Ready for reads and writes.
    Active,
}

/// Lifecycle state of a secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexStatus {
    /// Being built.
    Creating,
    /// Settings are being changed.
    Updating,
    /// Being removed.
    Deleting,
    /// Ready for queries.
    Active,
}

impl std::fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexStatus::Creating => write!(f, "creating"),
            IndexStatus::Updating => write!(f, "updating"),
            IndexStatus::Deleting => write!(f, "deleting"),
            IndexStatus::Active => write!(f, "active"),
        }
    }
}

/// A global secondary index as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDescription {
    /// Index definition.
    #[serde(flatten)]
    pub definition: IndexDefinition,
    /// Current state.
    pub status: IndexStatus,
}

/// Current state of a table as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDescription {
    /// Table name.
    pub table_name: String,
    /// Lifecycle state.
    pub status: TableStatus,
    /// Primary key schema.
    pub key_schema: Vec<KeySchemaElement>,
    /// Key attribute types.
    pub attribute_definitions: Vec<AttributeDefinition>,
    /// Global secondary indexes.
    #[serde(default)]
    pub global_secondary_indexes: Vec<IndexDescription>,
    /// Local secondary indexes.
    #[serde(default)]
    pub local_secondary_indexes: Vec<IndexDefinition>,
    /// Billing mode.
    pub billing_mode: BillingMode,
    /// Change stream.
    #[serde(default)]
    pub stream: Option<StreamSpecification>,
    /// Point-in-time recovery.
    #[serde(default)]
    pub point_in_time_recovery: bool,
    /// Server-side encryption, if explicitly configured.
    #[serde(default)]
    pub encryption: Option<EncryptionSettings>,
    /// Resource tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Number of stored items.
    #[serde(default)]
    pub item_count: u64,
}

impl TableDescription {
    /// Describe a freshly created table.
    pub fn from_definition(definition: &TableDefinition, status: TableStatus) -> Self {
        Self {
            table_name: definition.table_name.clone(),
            status,
            key_schema: definition.key_schema.clone(),
            attribute_definitions: definition.attribute_definitions.clone(),
            global_secondary_indexes: definition
                .global_secondary_indexes
                .iter()
                .map(|index| IndexDescription {
                    definition: index.clone(),
                    status: IndexStatus::Active,
                })
                .collect(),
            local_secondary_indexes: definition.local_secondary_indexes.clone(),
            billing_mode: definition.billing_mode,
            stream: definition.stream,
            point_in_time_recovery: false,
            encryption: None,
            tags: definition.tags.clone(),
            item_count: 0,
        }
    }

    /// Whether the table accepts reads and writes.
    pub fn is_active(&self) -> bool {
        self.status == TableStatus::Active
    }

    /// Look up a global secondary index by name.
    pub fn global_index(&self, index_name: &str) -> Option<&IndexDescription> {
        self.global_secondary_indexes
            .iter()
            .find(|index| index.definition.index_name == index_name)
    }

    /// Encode the primary key of `item` as a stable, ordered string.
    ///
    /// Key attributes are emitted in key schema order so that hash and
    /// range values sort together.
    pub fn primary_key(&self, item: &Item) -> Result<String, BackendError> {
        let mut parts = Vec::with_capacity(self.key_schema.len());
        for element in &self.key_schema {
            let value = item
                .get(&element.attribute_name)
                .filter(|value| !value.is_null())
                .ok_or_else(|| BackendError::MissingKey {
                    table: self.table_name.clone(),
                    attribute: element.attribute_name.clone(),
                })?;
            parts.push(value.clone());
        }
        Ok(serde_json::to_string(&parts)?)
    }

    /// Keep only the key attributes of `item`.
    pub fn key_of(&self, item: &Item) -> Item {
        self.key_schema
            .iter()
            .filter_map(|element| {
                item.get(&element.attribute_name)
                    .map(|value| (element.attribute_name.clone(), value.clone()))
            })
            .collect()
    }
}

/// A single table setting change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TableUpdate {
    /// Switch billing mode.
    BillingMode(BillingMode),
    /// Enable, disable or reconfigure the change stream.
    Stream(StreamSpecification),
    /// Enable server-side encryption.
    Encryption(EncryptionSettings),
}

/// An index add or remove request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IndexUpdate {
    /// Start building a global secondary index.
    Create {
        /// Index definition.
        index: IndexDefinition,
        /// Types of any new key attributes.
        attribute_definitions: Vec<AttributeDefinition>,
    },
    /// Start removing a global secondary index.
    Delete {
        /// Index name.
        index_name: String,
    },
}

/// One page request of a full table scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    /// Table to scan.
    pub table_name: String,
    /// Maximum items per page.
    pub limit: usize,
    /// Continuation token returned by the previous page.
    pub exclusive_start_key: Option<String>,
}

impl ScanRequest {
    /// Request the first page of `table_name`.
    pub fn new(table_name: impl Into<String>, limit: usize) -> Self {
        Self {
            table_name: table_name.into(),
            limit: limit.max(1),
            exclusive_start_key: None,
        }
    }

    /// Continue after the given token.
    pub fn starting_after(mut self, token: Option<String>) -> Self {
        self.exclusive_start_key = token;
        self
    }
}

/// One page of scan results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanPage {
    /// Items in key order.
    pub items: Vec<Item>,
    /// Token for the next page; `None` when the scan is exhausted.
    pub last_evaluated_key: Option<String>,
}

/// Metadata of an on-demand backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDescription {
    /// Backend-assigned backup id.
    pub backup_id: String,
    /// Caller-supplied name.
    pub backup_name: String,
    /// Source table.
    pub table_name: String,
    /// Items captured.
    pub item_count: u64,
    /// When the backup was taken.
    pub created_at: DateTime<Utc>,
}

/// Table lifecycle, scan and batched-write primitives the engine needs
/// from a key-value store.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Describe a table, or `None` if it does not exist.
    async fn describe_table(&self, table_name: &str)
        -> Result<Option<TableDescription>, BackendError>;

    /// Issue table creation. The table may start in [`TableStatus::Creating`].
    async fn create_table(
        &self,
        definition: &TableDefinition,
    ) -> Result<TableDescription, BackendError>;

    /// Delete a table and all its items.
    async fn delete_table(&self, table_name: &str) -> Result<(), BackendError>;

    /// Apply one settings change to a table.
    async fn update_table(&self, table_name: &str, update: &TableUpdate)
        -> Result<(), BackendError>;

    /// Start adding or removing a global secondary index.
    async fn update_index(
        &self,
        table_name: &str,
        update: &IndexUpdate,
    ) -> Result<IndexStatus, BackendError>;

    /// Read one page of a full table scan.
    async fn scan(&self, request: &ScanRequest) -> Result<ScanPage, BackendError>;

    /// Write up to [`MAX_BATCH_WRITE_ITEMS`] items, replacing items with the same key.
    async fn batch_write(&self, table_name: &str, items: &[Item]) -> Result<(), BackendError>;

    /// Write a single item.
    async fn put_item(&self, table_name: &str, item: &Item) -> Result<(), BackendError>;

    /// Read a single item by key.
    async fn get_item(&self, table_name: &str, key: &Item) -> Result<Option<Item>, BackendError>;

    /// Delete a single item by key.
    async fn delete_item(&self, table_name: &str, key: &Item) -> Result<(), BackendError>;

    /// Take an on-demand backup of a table.
    async fn create_backup(
        &self,
        table_name: &str,
        backup_name: &str,
    ) -> Result<BackupDescription, BackendError>;

    /// Restore a backup into a new table.
    async fn restore_backup(&self, backup_id: &str, target_table: &str)
        -> Result<(), BackendError>;

    /// Toggle point-in-time recovery.
    async fn set_point_in_time_recovery(
        &self,
        table_name: &str,
        enabled: bool,
    ) -> Result<(), BackendError>;

    /// Add or overwrite resource tags.
    async fn tag_table(
        &self,
        table_name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn users_description() -> TableDescription {
        let definition = TableDefinition {
            table_name: "users".to_string(),
            key_schema: vec![KeySchemaElement::hash("tenant"), KeySchemaElement::range("id")],
            attribute_definitions: vec![
                AttributeDefinition::new("tenant", AttributeType::String),
                AttributeDefinition::new("id", AttributeType::Number),
            ],
            global_secondary_indexes: Vec::new(),
            local_secondary_indexes: Vec::new(),
            billing_mode: BillingMode::default(),
            stream: None,
            tags: BTreeMap::new(),
        };
        TableDescription::from_definition(&definition, TableStatus::Active)
    }

    fn item(value: Value) -> Item {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_primary_key_uses_schema_order() {
        let desc = users_description();
        let key = desc
            .primary_key(&item(json!({"id": 7, "tenant": "acme", "name": "x"})))
            .unwrap();
        assert_eq!(key, r#"["acme",7]"#);
    }

    #[test]
    fn test_primary_key_missing_attribute() {
        let desc = users_description();
        let err = desc.primary_key(&item(json!({"tenant": "acme"}))).unwrap_err();
        assert!(matches!(err, BackendError::MissingKey { ref attribute, .. } if attribute == "id"));
    }

    #[test]
    fn test_key_of() {
        let desc = users_description();
        let key = desc.key_of(&item(json!({"id": 7, "tenant": "acme", "name": "x"})));
        assert_eq!(key.len(), 2);
        assert!(!key.contains_key("name"));
    }

    #[test]
    fn test_billing_mode_wire_format() {
        let provisioned: BillingMode = serde_json::from_value(json!({
            "mode": "PROVISIONED",
            "readCapacityUnits": 5,
            "writeCapacityUnits": 10
        }))
        .unwrap();
        assert_eq!(
            provisioned,
            BillingMode::Provisioned {
                read_capacity_units: 5,
                write_capacity_units: 10
            }
        );

        let on_demand: BillingMode =
            serde_json::from_value(json!({"mode": "PAY_PER_REQUEST"})).unwrap();
        assert_eq!(on_demand, BillingMode::PayPerRequest);
    }
}
