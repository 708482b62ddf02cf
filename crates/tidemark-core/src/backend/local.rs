//! Local storage backend on sled.
//!
//! Layout:
//! - `tidemark:tables` maps table name to its JSON [`TableDescription`]
//! - `table:<name>` holds the items of one table, keyed by encoded primary key
//! - `tidemark:backups` maps backup id to its JSON [`BackupRecord`]
//! - `backup:<id>` holds the items captured by one backup
//!
//! Tables are active as soon as they are created; index builds complete
//! synchronously but are still reported as `CREATING` to the caller.

use super::{
    BackendError, BackupDescription, IndexDescription, IndexStatus, IndexUpdate, Item, ScanPage,
    ScanRequest, StorageBackend, TableDefinition, TableDescription, TableStatus, TableUpdate,
    MAX_BATCH_WRITE_ITEMS,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use uuid::Uuid;

/// Persisted backup metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackupRecord {
    description: BackupDescription,
    table: TableDescription,
}

/// [`StorageBackend`] persisting tables in a local sled database.
pub struct SledBackend {
    db: sled::Db,
    tables: sled::Tree,
    backups: sled::Tree,
}

impl SledBackend {
    /// Tree holding table descriptions.
    pub const TABLES_TREE: &'static str = "tidemark:tables";

    /// Tree holding backup metadata.
    pub const BACKUPS_TREE: &'static str = "tidemark:backups";

    /// Open or create a backend in `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        Self::from_db(sled::open(path)?)
    }

    /// Open a throwaway backend that is removed when dropped.
    pub fn temporary() -> Result<Self, BackendError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    /// Wrap an already opened sled database.
    pub fn from_db(db: sled::Db) -> Result<Self, BackendError> {
        let tables = db.open_tree(Self::TABLES_TREE)?;
        let backups = db.open_tree(Self::BACKUPS_TREE)?;
        Ok(Self { db, tables, backups })
    }

    /// Flush pending writes to disk.
    pub async fn flush(&self) -> Result<(), BackendError> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn data_tree(&self, table_name: &str) -> Result<sled::Tree, BackendError> {
        Ok(self.db.open_tree(format!("table:{}", table_name))?)
    }

    fn backup_tree(&self, backup_id: &str) -> Result<sled::Tree, BackendError> {
        Ok(self.db.open_tree(format!("backup:{}", backup_id))?)
    }

    fn load_description(&self, table_name: &str) -> Result<Option<TableDescription>, BackendError> {
        match self.tables.get(table_name)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn require_description(&self, table_name: &str) -> Result<TableDescription, BackendError> {
        self.load_description(table_name)?
            .ok_or_else(|| BackendError::TableNotFound(table_name.to_string()))
    }

    fn save_description(&self, description: &TableDescription) -> Result<(), BackendError> {
        let bytes = serde_json::to_vec(description)?;
        self.tables.insert(description.table_name.as_bytes(), bytes)?;
        Ok(())
    }

    fn write_items(
        &self,
        description: &TableDescription,
        items: &[Item],
    ) -> Result<(), BackendError> {
        let mut batch = sled::Batch::default();
        for item in items {
            let key = description.primary_key(item)?;
            batch.insert(key.as_bytes(), serde_json::to_vec(item)?);
        }
        self.data_tree(&description.table_name)?.apply_batch(batch)?;
        Ok(())
    }

    fn copy_tree(from: &sled::Tree, to: &sled::Tree) -> Result<u64, BackendError> {
        let mut batch = sled::Batch::default();
        let mut count = 0u64;
        for entry in from.iter() {
            let (key, value) = entry?;
            batch.insert(key, value);
            count += 1;
        }
        to.apply_batch(batch)?;
        Ok(count)
    }
}

#[async_trait]
impl StorageBackend for SledBackend {
    async fn describe_table(
        &self,
        table_name: &str,
    ) -> Result<Option<TableDescription>, BackendError> {
        let Some(mut description) = self.load_description(table_name)? else {
            return Ok(None);
        };
        description.item_count = self.data_tree(table_name)?.len() as u64;
        Ok(Some(description))
    }

    async fn create_table(
        &self,
        definition: &TableDefinition,
    ) -> Result<TableDescription, BackendError> {
        if self.load_description(&definition.table_name)?.is_some() {
            return Err(BackendError::TableExists(definition.table_name.clone()));
        }
        let description = TableDescription::from_definition(definition, TableStatus::Active);
        self.save_description(&description)?;
        self.data_tree(&definition.table_name)?;
        Ok(description)
    }

    async fn delete_table(&self, table_name: &str) -> Result<(), BackendError> {
        if self.tables.remove(table_name)?.is_none() {
            return Err(BackendError::TableNotFound(table_name.to_string()));
        }
        self.db.drop_tree(format!("table:{}", table_name))?;
        Ok(())
    }

    async fn update_table(
        &self,
        table_name: &str,
        update: &TableUpdate,
    ) -> Result<(), BackendError> {
        let mut description = self.require_description(table_name)?;
        match update {
            TableUpdate::BillingMode(mode) => description.billing_mode = *mode,
            TableUpdate::Stream(stream) => description.stream = Some(*stream),
            TableUpdate::Encryption(settings) => description.encryption = Some(settings.clone()),
        }
        self.save_description(&description)
    }

    async fn update_index(
        &self,
        table_name: &str,
        update: &IndexUpdate,
    ) -> Result<IndexStatus, BackendError> {
        let mut description = self.require_description(table_name)?;
        let reported = match update {
            IndexUpdate::Create {
                index,
                attribute_definitions,
            } => {
                if description.global_index(&index.index_name).is_some() {
                    return Err(BackendError::IndexExists {
                        table: table_name.to_string(),
                        index: index.index_name.clone(),
                    });
                }
                description.global_secondary_indexes.push(IndexDescription {
                    definition: index.clone(),
                    status: IndexStatus::Active,
                });
                for definition in attribute_definitions {
                    if !description
                        .attribute_definitions
                        .iter()
                        .any(|attr| attr.attribute_name == definition.attribute_name)
                    {
                        description.attribute_definitions.push(definition.clone());
                    }
                }
                IndexStatus::Creating
            }
            IndexUpdate::Delete { index_name } => {
                let before = description.global_secondary_indexes.len();
                description
                    .global_secondary_indexes
                    .retain(|index| &index.definition.index_name != index_name);
                if description.global_secondary_indexes.len() == before {
                    return Err(BackendError::IndexNotFound {
                        table: table_name.to_string(),
                        index: index_name.clone(),
                    });
                }
                IndexStatus::Deleting
            }
        };
        self.save_description(&description)?;
        Ok(reported)
    }

    async fn scan(&self, request: &ScanRequest) -> Result<ScanPage, BackendError> {
        self.require_description(&request.table_name)?;
        let tree = self.data_tree(&request.table_name)?;

        let lower = match &request.exclusive_start_key {
            Some(token) => Bound::Excluded(sled::IVec::from(token.as_bytes())),
            None => Bound::Unbounded,
        };
        let mut range = tree.range::<sled::IVec, _>((lower, Bound::Unbounded));

        let mut page = ScanPage::default();
        let mut last_key = None;
        for entry in range.by_ref().take(request.limit) {
            let (key, value) = entry?;
            page.items.push(serde_json::from_slice(&value)?);
            last_key = Some(key);
        }
        if range.next().transpose()?.is_some() {
            page.last_evaluated_key = last_key
                .map(|key| String::from_utf8(key.to_vec()))
                .transpose()
                .map_err(|e| BackendError::InvalidToken(e.to_string()))?;
        }
        Ok(page)
    }

    async fn batch_write(&self, table_name: &str, items: &[Item]) -> Result<(), BackendError> {
        if items.len() > MAX_BATCH_WRITE_ITEMS {
            return Err(BackendError::BatchTooLarge {
                size: items.len(),
                limit: MAX_BATCH_WRITE_ITEMS,
            });
        }
        let description = self.require_description(table_name)?;
        self.write_items(&description, items)
    }

    async fn put_item(&self, table_name: &str, item: &Item) -> Result<(), BackendError> {
        let description = self.require_description(table_name)?;
        self.write_items(&description, std::slice::from_ref(item))
    }

    async fn get_item(&self, table_name: &str, key: &Item) -> Result<Option<Item>, BackendError> {
        let description = self.require_description(table_name)?;
        let encoded = description.primary_key(key)?;
        match self.data_tree(table_name)?.get(encoded.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn delete_item(&self, table_name: &str, key: &Item) -> Result<(), BackendError> {
        let description = self.require_description(table_name)?;
        let encoded = description.primary_key(key)?;
        self.data_tree(table_name)?.remove(encoded.as_bytes())?;
        Ok(())
    }

    async fn create_backup(
        &self,
        table_name: &str,
        backup_name: &str,
    ) -> Result<BackupDescription, BackendError> {
        let table = self.require_description(table_name)?;
        let backup_id = format!("backup-{}", Uuid::new_v4().simple());

        let item_count = Self::copy_tree(&self.data_tree(table_name)?, &self.backup_tree(&backup_id)?)?;
        let description = BackupDescription {
            backup_id: backup_id.clone(),
            backup_name: backup_name.to_string(),
            table_name: table_name.to_string(),
            item_count,
            created_at: Utc::now(),
        };
        let record = BackupRecord {
            description: description.clone(),
            table,
        };
        self.backups
            .insert(backup_id.as_bytes(), serde_json::to_vec(&record)?)?;
        Ok(description)
    }

    async fn restore_backup(
        &self,
        backup_id: &str,
        target_table: &str,
    ) -> Result<(), BackendError> {
        let record: BackupRecord = match self.backups.get(backup_id)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => return Err(BackendError::BackupNotFound(backup_id.to_string())),
        };
        if self.load_description(target_table)?.is_some() {
            return Err(BackendError::TableExists(target_table.to_string()));
        }

        let mut description = record.table;
        description.table_name = target_table.to_string();
        description.status = TableStatus::Active;
        description.item_count = 0;
        Self::copy_tree(&self.backup_tree(backup_id)?, &self.data_tree(target_table)?)?;
        self.save_description(&description)
    }

    async fn set_point_in_time_recovery(
        &self,
        table_name: &str,
        enabled: bool,
    ) -> Result<(), BackendError> {
        let mut description = self.require_description(table_name)?;
        description.point_in_time_recovery = enabled;
        self.save_description(&description)
    }

    async fn tag_table(
        &self,
        table_name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), BackendError> {
        let mut description = self.require_description(table_name)?;
        description
            .tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.save_description(&description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        AttributeDefinition, AttributeType, BillingMode, IndexDefinition, KeySchemaElement,
        Projection,
    };
    use serde_json::json;
    use tempfile::tempdir;

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

    fn item(id: &str) -> Item {
        json!({"id": id, "name": format!("user {}", id)})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_table_lifecycle_persists() {
        let dir = tempdir().unwrap();
        {
            let backend = SledBackend::open(dir.path()).unwrap();
            backend.create_table(&definition("users")).await.unwrap();
            backend.put_item("users", &item("a")).await.unwrap();
            backend.flush().await.unwrap();
        }

        let backend = SledBackend::open(dir.path()).unwrap();
        let description = backend.describe_table("users").await.unwrap().unwrap();
        assert!(description.is_active());
        assert_eq!(description.item_count, 1);

        backend.delete_table("users").await.unwrap();
        assert!(backend.describe_table("users").await.unwrap().is_none());
        assert!(matches!(
            backend.delete_table("users").await,
            Err(BackendError::TableNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_scan_pages_in_key_order() {
        let backend = SledBackend::temporary().unwrap();
        backend.create_table(&definition("users")).await.unwrap();
        let items: Vec<Item> = ["d", "a", "c", "b", "e"].iter().map(|id| item(id)).collect();
        backend.batch_write("users", &items).await.unwrap();

        let first = backend.scan(&ScanRequest::new("users", 2)).await.unwrap();
        assert_eq!(first.items[0]["id"], "a");
        assert!(first.last_evaluated_key.is_some());

        let second = backend
            .scan(&ScanRequest::new("users", 10).starting_after(first.last_evaluated_key))
            .await
            .unwrap();
        assert_eq!(second.items.len(), 3);
        assert!(second.last_evaluated_key.is_none());
    }

    #[tokio::test]
    async fn test_index_and_settings_updates() {
        let backend = SledBackend::temporary().unwrap();
        backend.create_table(&definition("users")).await.unwrap();

        let index = IndexDefinition {
            index_name: "by_email".to_string(),
            key_schema: vec![KeySchemaElement::hash("email")],
            projection: Projection::default(),
        };
        let status = backend
            .update_index(
                "users",
                &IndexUpdate::Create {
                    index,
                    attribute_definitions: vec![AttributeDefinition::new(
                        "email",
                        AttributeType::String,
                    )],
                },
            )
            .await
            .unwrap();
        assert_eq!(status, IndexStatus::Creating);

        backend.set_point_in_time_recovery("users", true).await.unwrap();
        let description = backend.describe_table("users").await.unwrap().unwrap();
        assert!(description.global_index("by_email").is_some());
        assert!(description.point_in_time_recovery);
        assert_eq!(description.attribute_definitions.len(), 2);
    }

    #[tokio::test]
    async fn test_backup_restore_roundtrip() {
        let backend = SledBackend::temporary().unwrap();
        backend.create_table(&definition("users")).await.unwrap();
        backend
            .batch_write("users", &[item("a"), item("b")])
            .await
            .unwrap();

        let backup = backend.create_backup("users", "pre-change").await.unwrap();
        assert_eq!(backup.item_count, 2);

        backend.restore_backup(&backup.backup_id, "users_copy").await.unwrap();
        let restored = backend.describe_table("users_copy").await.unwrap().unwrap();
        assert_eq!(restored.item_count, 2);
        assert!(restored.is_active());
    }
}
