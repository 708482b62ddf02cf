//! Append-only migration history.
//!
//! Each finished migration produces exactly one [`HistoryRecord`]. While a
//! migration runs, an [`InFlightRecord`] marks it so a restarted process can
//! archive migrations that never reached a terminal status.

use crate::backend::{
    AttributeDefinition, AttributeType, BackendError, BillingMode, Item, KeySchemaElement,
    ScanRequest, StorageBackend, TableDefinition,
};
use crate::config::EngineConfig;
use crate::context::Environment;
use crate::migration::MigrationStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Key attribute of both history tables.
pub const MIGRATION_ID_ATTRIBUTE: &str = "migrationId";

/// Archived outcome of one migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub migration_id: String,
    /// When the migration reached its terminal status.
    pub applied_at: DateTime<Utc>,
    pub name: String,
    pub version: String,
    pub status: MigrationStatus,
    pub environment: Environment,
    pub region: String,
    pub duration_ms: u64,
    pub operation_count: usize,
    pub successful_operation_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Marker for a migration that has started but not finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightRecord {
    pub migration_id: String,
    pub name: String,
    pub version: String,
    pub environment: Environment,
    pub region: String,
    pub started_at: DateTime<Utc>,
    pub operation_count: usize,
}

impl InFlightRecord {
    /// Archive record for a migration interrupted by a process restart.
    pub fn into_interrupted(self, now: DateTime<Utc>) -> HistoryRecord {
        HistoryRecord {
            duration_ms: (now - self.started_at).num_milliseconds().max(0) as u64,
            migration_id: self.migration_id,
            applied_at: now,
            name: self.name,
            version: self.version,
            status: MigrationStatus::Failed,
            environment: self.environment,
            region: self.region,
            operation_count: self.operation_count,
            successful_operation_count: 0,
            error: Some(INTERRUPTED_ERROR.to_string()),
        }
    }
}

/// Error recorded for migrations archived by recovery.
pub const INTERRUPTED_ERROR: &str = "interrupted: process restarted before completion";

/// History store errors.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// A record for this migration id already exists.
    #[error("history record already exists for migration {0}")]
    Conflict(String),

    /// A history table did not become active in time.
    #[error("history table {table} did not become active within {waited:?}")]
    TableNotActive { table: String, waited: Duration },

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistent store of history records and in-flight markers.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append a record. Fails with [`HistoryError::Conflict`] if the id is taken.
    async fn append(&self, record: &HistoryRecord) -> Result<(), HistoryError>;

    /// Fetch the record of one migration.
    async fn get(&self, migration_id: &str) -> Result<Option<HistoryRecord>, HistoryError>;

    /// Most recent records first, at most `limit`, optionally for one environment.
    async fn list(
        &self,
        limit: usize,
        environment: Option<Environment>,
    ) -> Result<Vec<HistoryRecord>, HistoryError>;

    /// Record that a migration has started.
    async fn mark_in_flight(&self, record: &InFlightRecord) -> Result<(), HistoryError>;

    /// Remove a migration's in-flight marker. Missing markers are ignored.
    async fn clear_in_flight(&self, migration_id: &str) -> Result<(), HistoryError>;

    /// Every marker left behind.
    async fn list_in_flight(&self) -> Result<Vec<InFlightRecord>, HistoryError>;
}

fn most_recent_first(
    mut records: Vec<HistoryRecord>,
    limit: usize,
    environment: Option<Environment>,
) -> Vec<HistoryRecord> {
    if let Some(environment) = environment {
        records.retain(|r| r.environment == environment);
    }
    records.sort_by(|a, b| {
        b.applied_at
            .cmp(&a.applied_at)
            .then_with(|| a.migration_id.cmp(&b.migration_id))
    });
    records.truncate(limit);
    records
}

/// In-process history store.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    records: Mutex<HashMap<String, HistoryRecord>>,
    in_flight: Mutex<BTreeMap<String, InFlightRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of archived records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, record: &HistoryRecord) -> Result<(), HistoryError> {
        let mut records = self.records.lock();
        if records.contains_key(&record.migration_id) {
            return Err(HistoryError::Conflict(record.migration_id.clone()));
        }
        records.insert(record.migration_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, migration_id: &str) -> Result<Option<HistoryRecord>, HistoryError> {
        Ok(self.records.lock().get(migration_id).cloned())
    }

    async fn list(
        &self,
        limit: usize,
        environment: Option<Environment>,
    ) -> Result<Vec<HistoryRecord>, HistoryError> {
        let records: Vec<HistoryRecord> = self.records.lock().values().cloned().collect();
        Ok(most_recent_first(records, limit, environment))
    }

    async fn mark_in_flight(&self, record: &InFlightRecord) -> Result<(), HistoryError> {
        self.in_flight
            .lock()
            .insert(record.migration_id.clone(), record.clone());
        Ok(())
    }

    async fn clear_in_flight(&self, migration_id: &str) -> Result<(), HistoryError> {
        self.in_flight.lock().remove(migration_id);
        Ok(())
    }

    async fn list_in_flight(&self) -> Result<Vec<InFlightRecord>, HistoryError> {
        Ok(self.in_flight.lock().values().cloned().collect())
    }
}

/// History persisted in two tables of the storage backend, keyed by
/// `migrationId`.
pub struct BackendHistoryStore {
    backend: Arc<dyn StorageBackend>,
    history_table: String,
    in_flight_table: String,
    scan_page_size: usize,
}

impl BackendHistoryStore {
    /// Open the store, creating both tables if needed and waiting until
    /// they are active.
    pub async fn open(
        backend: Arc<dyn StorageBackend>,
        config: &EngineConfig,
    ) -> Result<Self, HistoryError> {
        let store = Self {
            backend,
            history_table: config.history_table.clone(),
            in_flight_table: config.in_flight_table.clone(),
            scan_page_size: config.scan_page_size,
        };
        for table in [&store.history_table, &store.in_flight_table] {
            store
                .ensure_table(table, config.table_active_timeout, config.table_poll_interval)
                .await?;
        }
        info!(
            history_table = %store.history_table,
            in_flight_table = %store.in_flight_table,
            "History store opened"
        );
        Ok(store)
    }

    async fn ensure_table(
        &self,
        table: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), HistoryError> {
        if self.backend.describe_table(table).await?.is_none() {
            let definition = TableDefinition {
                table_name: table.to_string(),
                key_schema: vec![KeySchemaElement::hash(MIGRATION_ID_ATTRIBUTE)],
                attribute_definitions: vec![AttributeDefinition::new(
                    MIGRATION_ID_ATTRIBUTE,
                    AttributeType::String,
                )],
                global_secondary_indexes: Vec::new(),
                local_secondary_indexes: Vec::new(),
                billing_mode: BillingMode::PayPerRequest,
                stream: None,
                tags: BTreeMap::new(),
            };
            match self.backend.create_table(&definition).await {
                Ok(_) | Err(BackendError::TableExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
            debug!(table = %table, "Created history table");
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(description) = self.backend.describe_table(table).await? {
                if description.is_active() {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(HistoryError::TableNotActive {
                    table: table.to_string(),
                    waited: timeout,
                });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    fn key(migration_id: &str) -> Item {
        let mut key = Item::new();
        key.insert(
            MIGRATION_ID_ATTRIBUTE.to_string(),
            Value::String(migration_id.to_string()),
        );
        key
    }

    fn to_item<T: Serialize>(value: &T) -> Result<Item, HistoryError> {
        match serde_json::to_value(value)? {
            Value::Object(item) => Ok(item),
            other => Err(HistoryError::Serialization(serde::ser::Error::custom(
                format!("expected object, got {}", other),
            ))),
        }
    }

    fn from_item<T: DeserializeOwned>(item: Item) -> Result<T, HistoryError> {
        Ok(serde_json::from_value(Value::Object(item))?)
    }

    async fn scan_all<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<T>, HistoryError> {
        let mut out = Vec::new();
        let mut token = None;
        loop {
            let request = ScanRequest::new(table, self.scan_page_size).starting_after(token);
            let page = self.backend.scan(&request).await?;
            for item in page.items {
                out.push(Self::from_item(item)?);
            }
            match page.last_evaluated_key {
                Some(next) => token = Some(next),
                None => return Ok(out),
            }
        }
    }
}

#[async_trait]
impl HistoryStore for BackendHistoryStore {
    async fn append(&self, record: &HistoryRecord) -> Result<(), HistoryError> {
        // Check-then-put; ids are UUIDs assigned by a single manager so the
        // window only matters for duplicate appends from recovery.
        let key = Self::key(&record.migration_id);
        if self.backend.get_item(&self.history_table, &key).await?.is_some() {
            return Err(HistoryError::Conflict(record.migration_id.clone()));
        }
        self.backend
            .put_item(&self.history_table, &Self::to_item(record)?)
            .await?;
        Ok(())
    }

    async fn get(&self, migration_id: &str) -> Result<Option<HistoryRecord>, HistoryError> {
        self.backend
            .get_item(&self.history_table, &Self::key(migration_id))
            .await?
            .map(Self::from_item)
            .transpose()
    }

    async fn list(
        &self,
        limit: usize,
        environment: Option<Environment>,
    ) -> Result<Vec<HistoryRecord>, HistoryError> {
        let records = self.scan_all(&self.history_table).await?;
        Ok(most_recent_first(records, limit, environment))
    }

    async fn mark_in_flight(&self, record: &InFlightRecord) -> Result<(), HistoryError> {
        self.backend
            .put_item(&self.in_flight_table, &Self::to_item(record)?)
            .await?;
        Ok(())
    }

    async fn clear_in_flight(&self, migration_id: &str) -> Result<(), HistoryError> {
        self.backend
            .delete_item(&self.in_flight_table, &Self::key(migration_id))
            .await?;
        Ok(())
    }

    async fn list_in_flight(&self) -> Result<Vec<InFlightRecord>, HistoryError> {
        self.scan_all(&self.in_flight_table).await
    }
}
