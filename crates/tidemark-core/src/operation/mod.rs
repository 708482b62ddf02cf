//! Operation catalog and registry.
//!
//! Every schema or data change a migration can make is one variant of the
//! closed [`Operation`] enum. The [`OperationRegistry`] dispatches each
//! variant to its handler with an exhaustive match, so an unknown operation
//! can only appear while parsing a spec.
//!
//! On the wire an operation is a flat JSON object whose `type` field names
//! the variant:
//!
//! ```json
//! {"type": "createGSI", "tableName": "users", "indexName": "by_email",
//!  "keySchema": [{"attributeName": "email", "keyType": "HASH"}],
//!  "required": false}
//! ```

pub mod admin;
pub mod data;
pub mod error;
pub mod index;
pub mod registry;
pub mod table;
pub mod toolchain;

pub use admin::{
    AddTags, CreateBackup, EnableEncryption, EnablePointInTimeRecovery, EnableStreams,
    RestoreBackup,
};
pub use data::{MigrateData, SeedData, TransformData};
pub use error::OperationError;
pub use index::{CreateIndex, DeleteIndex};
pub use registry::OperationRegistry;
pub use table::{DeleteTable, ModifyTable, TableModification};
pub use toolchain::{ProcessToolRunner, ToolChain, ToolError, ToolInvocation, ToolRunner, ToolStep};

use crate::backend::TableDefinition;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Operation type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationType {
    #[serde(rename = "createTable")]
    CreateTable,
    #[serde(rename = "modifyTable")]
    ModifyTable,
    #[serde(rename = "deleteTable")]
    DeleteTable,
    #[serde(rename = "createGSI")]
    CreateGsi,
    #[serde(rename = "deleteGSI")]
    DeleteGsi,
    #[serde(rename = "migrateData")]
    MigrateData,
    #[serde(rename = "transformData")]
    TransformData,
    #[serde(rename = "seedData")]
    SeedData,
    #[serde(rename = "createBackup")]
    CreateBackup,
    #[serde(rename = "restoreBackup")]
    RestoreBackup,
    #[serde(rename = "enableStreams")]
    EnableStreams,
    #[serde(rename = "enablePointInTimeRecovery")]
    EnablePointInTimeRecovery,
    #[serde(rename = "addTags")]
    AddTags,
    #[serde(rename = "enableEncryption")]
    EnableEncryption,
    #[serde(rename = "customScript")]
    CustomScript,
    #[serde(rename = "toolChain")]
    ToolChain,
}

impl OperationType {
    /// Every registered operation type.
    pub const ALL: [OperationType; 16] = [
        OperationType::CreateTable,
        OperationType::ModifyTable,
        OperationType::DeleteTable,
        OperationType::CreateGsi,
        OperationType::DeleteGsi,
        OperationType::MigrateData,
        OperationType::TransformData,
        OperationType::SeedData,
        OperationType::CreateBackup,
        OperationType::RestoreBackup,
        OperationType::EnableStreams,
        OperationType::EnablePointInTimeRecovery,
        OperationType::AddTags,
        OperationType::EnableEncryption,
        OperationType::CustomScript,
        OperationType::ToolChain,
    ];

    /// Wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::CreateTable => "createTable",
            OperationType::ModifyTable => "modifyTable",
            OperationType::DeleteTable => "deleteTable",
            OperationType::CreateGsi => "createGSI",
            OperationType::DeleteGsi => "deleteGSI",
            OperationType::MigrateData => "migrateData",
            OperationType::TransformData => "transformData",
            OperationType::SeedData => "seedData",
            OperationType::CreateBackup => "createBackup",
            OperationType::RestoreBackup => "restoreBackup",
            OperationType::EnableStreams => "enableStreams",
            OperationType::EnablePointInTimeRecovery => "enablePointInTimeRecovery",
            OperationType::AddTags => "addTags",
            OperationType::EnableEncryption => "enableEncryption",
            OperationType::CustomScript => "customScript",
            OperationType::ToolChain => "toolChain",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// A single schema or data change with its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    #[serde(rename = "createTable")]
    CreateTable(TableDefinition),
    #[serde(rename = "modifyTable")]
    ModifyTable(ModifyTable),
    #[serde(rename = "deleteTable")]
    DeleteTable(DeleteTable),
    #[serde(rename = "createGSI")]
    CreateGsi(CreateIndex),
    #[serde(rename = "deleteGSI")]
    DeleteGsi(DeleteIndex),
    #[serde(rename = "migrateData")]
    MigrateData(MigrateData),
    #[serde(rename = "transformData")]
    TransformData(TransformData),
    #[serde(rename = "seedData")]
    SeedData(SeedData),
    #[serde(rename = "createBackup")]
    CreateBackup(CreateBackup),
    #[serde(rename = "restoreBackup")]
    RestoreBackup(RestoreBackup),
    #[serde(rename = "enableStreams")]
    EnableStreams(EnableStreams),
    #[serde(rename = "enablePointInTimeRecovery")]
    EnablePointInTimeRecovery(EnablePointInTimeRecovery),
    #[serde(rename = "addTags")]
    AddTags(AddTags),
    #[serde(rename = "enableEncryption")]
    EnableEncryption(EnableEncryption),
    #[serde(rename = "customScript")]
    CustomScript(ToolChain),
    #[serde(rename = "toolChain")]
    ToolChain(ToolChain),
}

impl Operation {
    /// Type tag of this operation.
    pub fn kind(&self) -> OperationType {
        match self {
            Operation::CreateTable(_) => OperationType::CreateTable,
            Operation::ModifyTable(_) => OperationType::ModifyTable,
            Operation::DeleteTable(_) => OperationType::DeleteTable,
            Operation::CreateGsi(_) => OperationType::CreateGsi,
            Operation::DeleteGsi(_) => OperationType::DeleteGsi,
            Operation::MigrateData(_) => OperationType::MigrateData,
            Operation::TransformData(_) => OperationType::TransformData,
            Operation::SeedData(_) => OperationType::SeedData,
            Operation::CreateBackup(_) => OperationType::CreateBackup,
            Operation::RestoreBackup(_) => OperationType::RestoreBackup,
            Operation::EnableStreams(_) => OperationType::EnableStreams,
            Operation::EnablePointInTimeRecovery(_) => OperationType::EnablePointInTimeRecovery,
            Operation::AddTags(_) => OperationType::AddTags,
            Operation::EnableEncryption(_) => OperationType::EnableEncryption,
            Operation::CustomScript(_) => OperationType::CustomScript,
            Operation::ToolChain(_) => OperationType::ToolChain,
        }
    }

    /// Tables this operation reads or writes, in payload order.
    pub fn table_names(&self) -> Vec<&str> {
        match self {
            Operation::CreateTable(def) => vec![def.table_name.as_str()],
            Operation::ModifyTable(op) => vec![op.table_name.as_str()],
            Operation::DeleteTable(op) => vec![op.table_name.as_str()],
            Operation::CreateGsi(op) => vec![op.table_name.as_str()],
            Operation::DeleteGsi(op) => vec![op.table_name.as_str()],
            Operation::MigrateData(op) => vec![op.source_table.as_str(), op.target_table.as_str()],
            Operation::TransformData(op) => vec![op.table_name.as_str()],
            Operation::SeedData(op) => vec![op.table_name.as_str()],
            Operation::CreateBackup(op) => vec![op.table_name.as_str()],
            Operation::RestoreBackup(op) => vec![op.target_table_name.as_str()],
            Operation::EnableStreams(op) => vec![op.table_name.as_str()],
            Operation::EnablePointInTimeRecovery(op) => vec![op.table_name.as_str()],
            Operation::AddTags(op) => vec![op.table_name.as_str()],
            Operation::EnableEncryption(op) => vec![op.table_name.as_str()],
            Operation::CustomScript(_) | Operation::ToolChain(_) => Vec::new(),
        }
    }

    /// One-line human description used in plans and logs.
    pub fn summary(&self) -> String {
        match self {
            Operation::CreateTable(def) => format!("create table {}", def.table_name),
            Operation::ModifyTable(op) => format!(
                "apply {} modification(s) to table {}",
                op.modifications.len(),
                op.table_name
            ),
            Operation::DeleteTable(op) => format!("delete table {}", op.table_name),
            Operation::CreateGsi(op) => {
                format!("create index {} on {}", op.index_name, op.table_name)
            }
            Operation::DeleteGsi(op) => {
                format!("delete index {} on {}", op.index_name, op.table_name)
            }
            Operation::MigrateData(op) => {
                format!("copy items from {} to {}", op.source_table, op.target_table)
            }
            Operation::TransformData(op) => match &op.filter {
                Some(filter) => format!("transform items of {} where {}", op.table_name, filter),
                None => format!("transform all items of {}", op.table_name),
            },
            Operation::SeedData(op) => {
                format!("seed {} item(s) into {}", op.items.len(), op.table_name)
            }
            Operation::CreateBackup(op) => format!("back up table {}", op.table_name),
            Operation::RestoreBackup(op) => format!(
                "restore backup {} into {}",
                op.backup_id, op.target_table_name
            ),
            Operation::EnableStreams(op) => format!("enable streams on {}", op.table_name),
            Operation::EnablePointInTimeRecovery(op) => {
                format!("enable point-in-time recovery on {}", op.table_name)
            }
            Operation::AddTags(op) => format!("tag table {}", op.table_name),
            Operation::EnableEncryption(op) => format!("enable encryption on {}", op.table_name),
            Operation::CustomScript(chain) | Operation::ToolChain(chain) => {
                let names: Vec<&str> = chain.steps.iter().map(|s| s.name.as_str()).collect();
                format!("run tool steps [{}]", names.join(", "))
            }
        }
    }
}

fn default_true() -> bool {
    true
}

/// An operation as listed in a migration spec, with its execution metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSpec {
    /// The operation and its payload.
    #[serde(flatten)]
    pub operation: Operation,

    /// When false, a failure is recorded and the migration continues.
    #[serde(default = "default_true")]
    pub required: bool,

    /// Whether the author declared a rollback path for this operation.
    #[serde(default)]
    pub rollback_supported: bool,

    /// Free-text description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Free-text duration estimate such as `"5m"` or `"30 seconds"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<String>,
}

impl OperationSpec {
    /// A required operation with no metadata.
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            required: true,
            rollback_supported: false,
            description: None,
            estimated_duration: None,
        }
    }

    /// Mark the operation optional.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the duration estimate.
    pub fn with_estimate(mut self, estimate: impl Into<String>) -> Self {
        self.estimated_duration = Some(estimate.into());
        self
    }

    /// Type tag.
    pub fn kind(&self) -> OperationType {
        self.operation.kind()
    }
}

/// What a handler did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Created,
    Skipped,
    Updated,
    Deleted,
    Creating,
    Deleting,
    Completed,
    BackedUp,
    Restored,
    Enabled,
    Tagged,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutcomeStatus::Created => "created",
            OutcomeStatus::Skipped => "skipped",
            OutcomeStatus::Updated => "updated",
            OutcomeStatus::Deleted => "deleted",
            OutcomeStatus::Creating => "creating",
            OutcomeStatus::Deleting => "deleting",
            OutcomeStatus::Completed => "completed",
            OutcomeStatus::BackedUp => "backed_up",
            OutcomeStatus::Restored => "restored",
            OutcomeStatus::Enabled => "enabled",
            OutcomeStatus::Tagged => "tagged",
        };
        write!(f, "{}", s)
    }
}

/// Successful handler result: an outcome plus operation-specific details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationOutput {
    /// Outcome.
    pub status: OutcomeStatus,
    /// Details such as table names, counts and batch errors.
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl OperationOutput {
    /// Output with no details.
    pub fn new(status: OutcomeStatus) -> Self {
        Self {
            status,
            details: Map::new(),
        }
    }

    /// Attach a detail field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Read a detail field.
    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }
}
