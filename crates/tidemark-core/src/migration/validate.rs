//! Spec validation.
//!
//! Blocking problems prevent submission; advisories are attached to the
//! migration as warnings.

use super::error::MigrationError;
use super::spec::MigrationSpec;
use crate::backend::KeyType;
use crate::context::Environment;
use crate::expr::Expression;
use crate::operation::{Operation, OperationSpec, ToolStep};
use serde::Serialize;

/// Outcome of validating a spec for a target environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// Blocking problems.
    pub errors: Vec<String>,
    /// Advisory problems.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Whether submission may proceed.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Convert blocking problems into an error, returning the warnings otherwise.
    pub fn into_result(self) -> Result<Vec<String>, MigrationError> {
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(MigrationError::Validation {
                errors: self.errors,
            })
        }
    }
}

/// Whether `version` is `MAJOR.MINOR.PATCH` with numeric parts.
pub fn is_semver(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}

/// Validate a spec for submission to `environment`.
pub fn validate(spec: &MigrationSpec, environment: Environment) -> ValidationReport {
    let mut report = ValidationReport::default();

    if spec.name.trim().is_empty() {
        report.errors.push("name is required".to_string());
    }
    if !is_semver(&spec.version) {
        report.errors.push(format!(
            "version '{}' must be MAJOR.MINOR.PATCH",
            spec.version
        ));
    }

    if spec.operations.is_empty() {
        report
            .warnings
            .push("operations list is empty; the migration will complete without changes".to_string());
    }
    for (index, operation) in spec.operations.iter().enumerate() {
        check_operation(&format!("operations[{}]", index), operation, &mut report);
    }
    if let Some(rollback) = &spec.rollback {
        for (index, operation) in rollback.iter().enumerate() {
            check_operation(&format!("rollback[{}]", index), operation, &mut report);
        }
    }
    check_steps("preHooks", &spec.pre_hooks, &mut report);
    check_steps("postHooks", &spec.post_hooks, &mut report);

    if environment.is_production() {
        // The handler rejects these when they run; optional ones only fail their own result.
        for (index, operation) in spec.operations.iter().enumerate() {
            if let Operation::DeleteTable(payload) = &operation.operation {
                if !payload.is_confirmed() {
                    report.warnings.push(format!(
                        "operations[{}] (deleteTable): production delete requires confirmation '{}' and will be rejected",
                        index,
                        payload.expected_confirmation()
                    ));
                }
            }
        }
        if !spec.backup_required {
            report
                .warnings
                .push("production migration does not set backupRequired".to_string());
        }
        if spec.rollback.as_ref().map_or(true, Vec::is_empty) {
            report
                .warnings
                .push("production migration has no rollback procedure".to_string());
        }
    }
    if let Some(intended) = spec.environment {
        if intended != environment {
            report.warnings.push(format!(
                "spec targets {} but is submitted to {}",
                intended, environment
            ));
        }
    }

    report
}

fn check_operation(at: &str, spec: &OperationSpec, report: &mut ValidationReport) {
    let mut error = |message: String| report.errors.push(format!("{} ({}): {}", at, spec.kind(), message));

    if spec.operation.table_names().iter().any(|t| t.trim().is_empty()) {
        error("table name must not be empty".to_string());
    }

    match &spec.operation {
        Operation::CreateTable(definition) => {
            let hash_keys = definition
                .key_schema
                .iter()
                .filter(|k| k.key_type == KeyType::Hash)
                .count();
            if hash_keys != 1 {
                error("key schema must contain exactly one HASH key".to_string());
            }
            for key in &definition.key_schema {
                if !definition
                    .attribute_definitions
                    .iter()
                    .any(|a| a.attribute_name == key.attribute_name)
                {
                    error(format!("key attribute '{}' has no attribute definition", key.attribute_name));
                }
            }
        }
        Operation::ModifyTable(payload) => {
            if payload.modifications.is_empty() {
                error("at least one modification is required".to_string());
            }
        }
        Operation::CreateGsi(payload) => {
            if payload.index_name.trim().is_empty() {
                error("index name must not be empty".to_string());
            }
            if payload.key_schema.is_empty() {
                error("index key schema must not be empty".to_string());
            }
        }
        Operation::DeleteGsi(payload) => {
            if payload.index_name.trim().is_empty() {
                error("index name must not be empty".to_string());
            }
        }
        Operation::MigrateData(payload) => {
            if payload.source_table == payload.target_table {
                error("source and target tables must differ; use transformData for in-place changes".to_string());
            }
            if let Some(Err(e)) = payload.transform.as_ref().map(|t| t.compile()) {
                error(format!("invalid transform: {}", e));
            }
        }
        Operation::TransformData(payload) => {
            if payload.transform.is_empty() {
                error("transform must set, rename or remove at least one field".to_string());
            }
            if let Err(e) = payload.transform.compile() {
                error(format!("invalid transform: {}", e));
            }
            if let Some(Err(e)) = payload.filter.as_deref().map(Expression::parse) {
                error(format!("invalid filter: {}", e));
            }
        }
        Operation::RestoreBackup(payload) => {
            if payload.backup_id.trim().is_empty() {
                error("backup id must not be empty".to_string());
            }
        }
        Operation::CustomScript(chain) | Operation::ToolChain(chain) => {
            if chain.steps.is_empty() {
                error("at least one step is required".to_string());
            }
        }
        Operation::DeleteTable(_)
        | Operation::SeedData(_)
        | Operation::CreateBackup(_)
        | Operation::EnableStreams(_)
        | Operation::EnablePointInTimeRecovery(_)
        | Operation::AddTags(_)
        | Operation::EnableEncryption(_) => {}
    }

    if let Operation::CustomScript(chain) | Operation::ToolChain(chain) = &spec.operation {
        check_steps(at, &chain.steps, report);
    }
}

fn check_steps(at: &str, steps: &[ToolStep], report: &mut ValidationReport) {
    for (index, step) in steps.iter().enumerate() {
        if step.name.trim().is_empty() {
            report
                .errors
                .push(format!("{} step {}: name must not be empty", at, index));
        }
        if step.tool.trim().is_empty() {
            report
                .errors
                .push(format!("{} step {}: tool must not be empty", at, index));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{DeleteTable, TransformData};
    use crate::expr::ItemTransform;
    use std::collections::BTreeMap;

    fn delete_users(confirmation: Option<&str>) -> OperationSpec {
        OperationSpec::new(Operation::DeleteTable(DeleteTable {
            table_name: "users".to_string(),
            confirmation: confirmation.map(String::from),
        }))
    }

    #[test]
    fn test_semver() {
        assert!(is_semver("1.0.0"));
        assert!(is_semver("10.20.30"));
        assert!(!is_semver("1.0"));
        assert!(!is_semver("1.0.x"));
        assert!(!is_semver("v1.0.0"));
        assert!(!is_semver(""));
    }

    #[test]
    fn test_accumulates_blocking_errors() {
        let spec = MigrationSpec::new("", "one").with_operation(OperationSpec::new(
            Operation::DeleteTable(DeleteTable {
                table_name: " ".to_string(),
                confirmation: None,
            }),
        ));
        let report = validate(&spec, Environment::Development);
        assert_eq!(report.errors.len(), 3);
        assert!(report.errors[2].contains("table name must not be empty"));
        assert!(matches!(
            report.into_result(),
            Err(MigrationError::Validation { ref errors }) if errors.len() == 3
        ));
    }

    #[test]
    fn test_unconfirmed_production_delete_is_advisory() {
        let spec = MigrationSpec::new("cleanup", "1.0.0")
            .with_backup()
            .with_operation(delete_users(None).optional())
            .with_rollback(vec![delete_users(None)]);
        let report = validate(&spec, Environment::Production);
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("operations[0] (deleteTable)"));
        assert!(report.warnings[0].contains("DELETE-users-CONFIRMED"));

        assert!(validate(&spec, Environment::Staging).warnings.is_empty());
    }

    #[test]
    fn test_production_advisories() {
        let spec = MigrationSpec::new("cleanup", "1.0.0")
            .with_operation(delete_users(Some("DELETE-users-CONFIRMED")));
        let report = validate(&spec, Environment::Production);
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 2);

        let report = validate(&spec.clone().with_backup(), Environment::Production);
        assert_eq!(report.warnings.len(), 1);

        let report = validate(&spec, Environment::Staging);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_empty_operations_is_advisory() {
        let report = validate(&MigrationSpec::new("noop", "0.1.0"), Environment::Development);
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_invalid_expressions_block() {
        let spec = MigrationSpec::new("fix", "1.0.0").with_operation(OperationSpec::new(
            Operation::TransformData(TransformData {
                table_name: "users".to_string(),
                transform: ItemTransform {
                    set: BTreeMap::from([("x".to_string(), "a +".to_string())]),
                    ..Default::default()
                },
                filter: Some("status ==".to_string()),
            }),
        ));
        let report = validate(&spec, Environment::Development);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors[0].contains("invalid transform"));
        assert!(report.errors[1].contains("invalid filter"));
    }
}
