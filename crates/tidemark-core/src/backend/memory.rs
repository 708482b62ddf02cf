//! In-memory storage backend.
//!
//! Keeps every table in a `BTreeMap` behind a mutex. Besides backing unit
//! and integration tests it can simulate slow table activation and inject
//! failures into specific batched writes.

use super::{
    BackendError, BackupDescription, IndexDescription, IndexStatus, IndexUpdate, Item, ScanPage,
    ScanRequest, StorageBackend, TableDefinition, TableDescription, TableStatus, TableUpdate,
    MAX_BATCH_WRITE_ITEMS,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

struct MemoryTable {
    description: TableDescription,
    items: BTreeMap<String, Item>,
    /// Describe calls left before a creating table turns active.
    pending_describes: u32,
}

struct MemoryBackup {
    description: BackupDescription,
    table: TableDescription,
    items: BTreeMap<String, Item>,
}

#[derive(Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    backups: BTreeMap<String, MemoryBackup>,
}

#[derive(Default)]
struct FaultPlan {
    /// 1-based ordinals of `batch_write` calls that fail.
    failing_batches: BTreeSet<u64>,
    /// Tables whose backups fail.
    failing_backups: BTreeSet<String>,
    /// Describe calls a new table spends in `CREATING`.
    activation_delay: u32,
}

/// Process-local [`StorageBackend`] for tests and embedding.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    faults: Mutex<FaultPlan>,
    calls: AtomicU64,
    batch_writes: AtomicU64,
    next_backup: AtomicU64,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep newly created tables in `CREATING` for `describes` describe calls.
    pub fn with_activation_delay(self, describes: u32) -> Self {
        self.faults.lock().activation_delay = describes;
        self
    }

    /// Make the `ordinal`-th `batch_write` call (1-based, counted across
    /// all tables) fail.
    pub fn fail_batch(&self, ordinal: u64) {
        self.faults.lock().failing_batches.insert(ordinal);
    }

    /// Make every backup of `table_name` fail.
    pub fn fail_backups_of(&self, table_name: impl Into<String>) {
        self.faults.lock().failing_backups.insert(table_name.into());
    }

    /// Total number of backend calls served.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of `batch_write` calls served, failed ones included.
    pub fn batch_write_count(&self) -> u64 {
        self.batch_writes.load(Ordering::SeqCst)
    }

    /// Names of all existing tables.
    pub fn table_names(&self) -> Vec<String> {
        self.state.lock().tables.keys().cloned().collect()
    }

    /// Snapshot of every item in a table, in key order.
    pub fn items(&self, table_name: &str) -> Vec<Item> {
        self.state
            .lock()
            .tables
            .get(table_name)
            .map(|table| table.items.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids of all backups taken so far.
    pub fn backup_ids(&self) -> Vec<String> {
        self.state.lock().backups.keys().cloned().collect()
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

fn write_items(table: &mut MemoryTable, items: &[Item]) -> Result<(), BackendError> {
    // Encode every key first so a bad item rejects the whole batch.
    let keyed = items
        .iter()
        .map(|item| Ok((table.description.primary_key(item)?, item.clone())))
        .collect::<Result<Vec<_>, BackendError>>()?;
    table.items.extend(keyed);
    Ok(())
}

fn table_mut<'a>(
    state: &'a mut MemoryState,
    table_name: &str,
) -> Result<&'a mut MemoryTable, BackendError> {
    state
        .tables
        .get_mut(table_name)
        .ok_or_else(|| BackendError::TableNotFound(table_name.to_string()))
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn describe_table(
        &self,
        table_name: &str,
    ) -> Result<Option<TableDescription>, BackendError> {
        self.record_call();
        let mut state = self.state.lock();
        let Some(table) = state.tables.get_mut(table_name) else {
            return Ok(None);
        };

        if table.description.status == TableStatus::Creating {
            if table.pending_describes == 0 {
                table.description.status = TableStatus::Active;
            } else {
                table.pending_describes -= 1;
            }
        }

        let mut description = table.description.clone();
        description.item_count = table.items.len() as u64;
        Ok(Some(description))
    }

    async fn create_table(
        &self,
        definition: &TableDefinition,
    ) -> Result<TableDescription, BackendError> {
        self.record_call();
        let delay = self.faults.lock().activation_delay;
        let mut state = self.state.lock();
        if state.tables.contains_key(&definition.table_name) {
            return Err(BackendError::TableExists(definition.table_name.clone()));
        }

        let description = TableDescription::from_definition(definition, TableStatus::Creating);
        state.tables.insert(
            definition.table_name.clone(),
            MemoryTable {
                description: description.clone(),
                items: BTreeMap::new(),
                pending_describes: delay,
            },
        );
        Ok(description)
    }

    async fn delete_table(&self, table_name: &str) -> Result<(), BackendError> {
        self.record_call();
        self.state
            .lock()
            .tables
            .remove(table_name)
            .map(|_| ())
            .ok_or_else(|| BackendError::TableNotFound(table_name.to_string()))
    }

    async fn update_table(
        &self,
        table_name: &str,
        update: &TableUpdate,
    ) -> Result<(), BackendError> {
        self.record_call();
        let mut state = self.state.lock();
        let table = table_mut(&mut state, table_name)?;
        match update {
            TableUpdate::BillingMode(mode) => table.description.billing_mode = *mode,
            TableUpdate::Stream(stream) => table.description.stream = Some(*stream),
            TableUpdate::Encryption(settings) => {
                table.description.encryption = Some(settings.clone())
            }
        }
        Ok(())
    }

    async fn update_index(
        &self,
        table_name: &str,
        update: &IndexUpdate,
    ) -> Result<IndexStatus, BackendError> {
        self.record_call();
        let mut state = self.state.lock();
        let table = table_mut(&mut state, table_name)?;
        let indexes = &mut table.description.global_secondary_indexes;

        match update {
            IndexUpdate::Create {
                index,
                attribute_definitions,
            } => {
                if indexes
                    .iter()
                    .any(|existing| existing.definition.index_name == index.index_name)
                {
                    return Err(BackendError::IndexExists {
                        table: table_name.to_string(),
                        index: index.index_name.clone(),
                    });
                }
                indexes.push(IndexDescription {
                    definition: index.clone(),
                    status: IndexStatus::Creating,
                });
                for definition in attribute_definitions {
                    let known = table
                        .description
                        .attribute_definitions
                        .iter()
                        .any(|attr| attr.attribute_name == definition.attribute_name);
                    if !known {
                        table.description.attribute_definitions.push(definition.clone());
                    }
                }
                Ok(IndexStatus::Creating)
            }
            IndexUpdate::Delete { index_name } => {
                let index = indexes
                    .iter_mut()
                    .find(|existing| &existing.definition.index_name == index_name)
                    .ok_or_else(|| BackendError::IndexNotFound {
                        table: table_name.to_string(),
                        index: index_name.clone(),
                    })?;
                index.status = IndexStatus::Deleting;
                Ok(IndexStatus::Deleting)
            }
        }
    }

    async fn scan(&self, request: &ScanRequest) -> Result<ScanPage, BackendError> {
        self.record_call();
        let state = self.state.lock();
        let table = state
            .tables
            .get(&request.table_name)
            .ok_or_else(|| BackendError::TableNotFound(request.table_name.clone()))?;

        let lower = match &request.exclusive_start_key {
            Some(token) => Bound::Excluded(token.clone()),
            None => Bound::Unbounded,
        };

        let mut range = table.items.range((lower, Bound::Unbounded));
        let mut page = ScanPage::default();
        let mut last_key = None;
        for (key, item) in range.by_ref().take(request.limit) {
            page.items.push(item.clone());
            last_key = Some(key.clone());
        }
        if range.next().is_some() {
            page.last_evaluated_key = last_key;
        }
        Ok(page)
    }

    async fn batch_write(&self, table_name: &str, items: &[Item]) -> Result<(), BackendError> {
        self.record_call();
        let ordinal = self.batch_writes.fetch_add(1, Ordering::SeqCst) + 1;
        if items.len() > MAX_BATCH_WRITE_ITEMS {
            return Err(BackendError::BatchTooLarge {
                size: items.len(),
                limit: MAX_BATCH_WRITE_ITEMS,
            });
        }
        if self.faults.lock().failing_batches.contains(&ordinal) {
            return Err(BackendError::Request(format!(
                "injected failure for batch write #{}",
                ordinal
            )));
        }

        let mut state = self.state.lock();
        write_items(table_mut(&mut state, table_name)?, items)
    }

    async fn put_item(&self, table_name: &str, item: &Item) -> Result<(), BackendError> {
        self.record_call();
        let mut state = self.state.lock();
        write_items(table_mut(&mut state, table_name)?, std::slice::from_ref(item))
    }

    async fn get_item(&self, table_name: &str, key: &Item) -> Result<Option<Item>, BackendError> {
        self.record_call();
        let mut state = self.state.lock();
        let table = table_mut(&mut state, table_name)?;
        let encoded = table.description.primary_key(key)?;
        Ok(table.items.get(&encoded).cloned())
    }

    async fn delete_item(&self, table_name: &str, key: &Item) -> Result<(), BackendError> {
        self.record_call();
        let mut state = self.state.lock();
        let table = table_mut(&mut state, table_name)?;
        let encoded = table.description.primary_key(key)?;
        table.items.remove(&encoded);
        Ok(())
    }

    async fn create_backup(
        &self,
        table_name: &str,
        backup_name: &str,
    ) -> Result<BackupDescription, BackendError> {
        self.record_call();
        if self.faults.lock().failing_backups.contains(table_name) {
            return Err(BackendError::Request(format!(
                "injected backup failure for table {}",
                table_name
            )));
        }

        let mut state = self.state.lock();
        let table = table_mut(&mut state, table_name)?;
        let items = table.items.clone();
        let mut snapshot = table.description.clone();
        snapshot.item_count = items.len() as u64;

        let ordinal = self.next_backup.fetch_add(1, Ordering::SeqCst) + 1;
        let description = BackupDescription {
            backup_id: format!("backup-{:06}", ordinal),
            backup_name: backup_name.to_string(),
            table_name: table_name.to_string(),
            item_count: items.len() as u64,
            created_at: Utc::now(),
        };
        state.backups.insert(
            description.backup_id.clone(),
            MemoryBackup {
                description: description.clone(),
                table: snapshot,
                items,
            },
        );
        Ok(description)
    }

    async fn restore_backup(
        &self,
        backup_id: &str,
        target_table: &str,
    ) -> Result<(), BackendError> {
        self.record_call();
        let mut state = self.state.lock();
        if state.tables.contains_key(target_table) {
            return Err(BackendError::TableExists(target_table.to_string()));
        }
        let backup = state
            .backups
            .get(backup_id)
            .ok_or_else(|| BackendError::BackupNotFound(backup_id.to_string()))?;

        let mut description = backup.table.clone();
        description.table_name = target_table.to_string();
        description.status = TableStatus::Active;
        tracing::debug!(
            backup_id,
            source = %backup.description.table_name,
            target = target_table,
            "restoring backup"
        );
        let table = MemoryTable {
            description,
            items: backup.items.clone(),
            pending_describes: 0,
        };
        state.tables.insert(target_table.to_string(), table);
        Ok(())
    }

    async fn set_point_in_time_recovery(
        &self,
        table_name: &str,
        enabled: bool,
    ) -> Result<(), BackendError> {
        self.record_call();
        let mut state = self.state.lock();
        table_mut(&mut state, table_name)?.description.point_in_time_recovery = enabled;
        Ok(())
    }

    async fn tag_table(
        &self,
        table_name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), BackendError> {
        self.record_call();
        let mut state = self.state.lock();
        table_mut(&mut state, table_name)?
            .description
            .tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AttributeDefinition, AttributeType, BillingMode, KeySchemaElement};
    use serde_json::json;

    fn definition(name: &str) -> TableDefinition {
        TableDefinition {
            table_name: name.to_string(),
            key_schema: vec![KeySchemaElement::hash("id")],
            attribute_definitions: vec![AttributeDefinition::new("id", AttributeType::Number)],
            global_secondary_indexes: Vec::new(),
            local_secondary_indexes: Vec::new(),
            billing_mode: BillingMode::PayPerRequest,
            stream: None,
            tags: BTreeMap::new(),
        }
    }

    fn numbered(range: std::ops::Range<u64>) -> Vec<Item> {
        range
            .map(|i| json!({"id": i}).as_object().cloned().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_activation_delay() {
        let backend = MemoryBackend::new().with_activation_delay(2);
        backend.create_table(&definition("users")).await.unwrap();

        let status = |d: Option<TableDescription>| d.unwrap().status;
        assert_eq!(status(backend.describe_table("users").await.unwrap()), TableStatus::Creating);
        assert_eq!(status(backend.describe_table("users").await.unwrap()), TableStatus::Creating);
        assert_eq!(status(backend.describe_table("users").await.unwrap()), TableStatus::Active);
    }

    #[tokio::test]
    async fn test_scan_pagination() {
        let backend = MemoryBackend::new();
        backend.create_table(&definition("users")).await.unwrap();
        for chunk in numbered(0..7).chunks(MAX_BATCH_WRITE_ITEMS) {
            backend.batch_write("users", chunk).await.unwrap();
        }

        let mut token = None;
        let mut seen = 0;
        let mut pages = 0;
        loop {
            let page = backend
                .scan(&ScanRequest::new("users", 3).starting_after(token))
                .await
                .unwrap();
            seen += page.items.len();
            pages += 1;
            token = page.last_evaluated_key;
            if token.is_none() {
                break;
            }
        }
        assert_eq!(seen, 7);
        assert_eq!(pages, 3);
    }

    #[tokio::test]
    async fn test_batch_limit_and_injected_failure() {
        let backend = MemoryBackend::new();
        backend.create_table(&definition("users")).await.unwrap();

        let err = backend.batch_write("users", &numbered(0..26)).await.unwrap_err();
        assert!(matches!(err, BackendError::BatchTooLarge { size: 26, .. }));

        backend.fail_batch(2);
        let err = backend.batch_write("users", &numbered(0..5)).await.unwrap_err();
        assert!(matches!(err, BackendError::Request(_)));
        backend.batch_write("users", &numbered(0..5)).await.unwrap();
        assert_eq!(backend.batch_write_count(), 3);
        assert_eq!(backend.items("users").len(), 5);
    }

    #[tokio::test]
    async fn test_backup_and_restore() {
        let backend = MemoryBackend::new();
        backend.create_table(&definition("users")).await.unwrap();
        backend.batch_write("users", &numbered(0..4)).await.unwrap();

        let backup = backend.create_backup("users", "nightly").await.unwrap();
        assert_eq!(backup.item_count, 4);

        backend.restore_backup(&backup.backup_id, "users_restored").await.unwrap();
        assert_eq!(backend.items("users_restored").len(), 4);

        let err = backend
            .restore_backup(&backup.backup_id, "users")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::TableExists(_)));
    }
}
