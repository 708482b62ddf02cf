//! Subcommand implementations.
//!
//! Every command returns the JSON document to print. Commands that only
//! read a spec never open the data directory.

use crate::config::{Args, Command};
use crate::error::CliError;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tidemark_core::migration::{validate, Planner};
use tidemark_core::{
    EngineConfig, Environment, MigrationManager, MigrationSpec, MigrationStatus,
    ProcessToolRunner, SledBackend,
};

/// Run the command selected by `args`.
pub async fn run(args: Args) -> Result<Value, CliError> {
    let config = args.into_config();
    match args.command {
        Command::Validate { spec, env } => validate_spec(&spec, env),
        Command::Plan { spec, env } => plan(&spec, env, &config),
        Command::Apply { spec, env } => {
            let manager = open_manager(&args.data_path, config).await?;
            apply(&manager, &spec, env).await
        }
        Command::Status { id } => {
            let manager = open_manager(&args.data_path, config).await?;
            Ok(serde_json::to_value(manager.history_record(&id).await?)?)
        }
        Command::History { limit, env } => {
            let manager = open_manager(&args.data_path, config).await?;
            Ok(serde_json::to_value(manager.list_history(limit, env).await?)?)
        }
        Command::Recover => {
            let manager = open_manager(&args.data_path, config).await?;
            Ok(serde_json::to_value(manager.recover().await?)?)
        }
    }
}

/// Read and parse a spec file.
pub fn load_spec(path: &Path) -> Result<MigrationSpec, CliError> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(MigrationSpec::from_json(&text)?)
}

/// `validate`: report blocking errors and advisories.
pub fn validate_spec(path: &Path, environment: Environment) -> Result<Value, CliError> {
    let spec = load_spec(path)?;
    let report = validate(&spec, environment);
    if !report.is_valid() {
        return Err(CliError::Invalid {
            errors: report.errors,
        });
    }
    Ok(json!({
        "valid": true,
        "name": spec.name,
        "version": spec.version,
        "environment": environment,
        "warnings": report.warnings,
    }))
}

/// `plan`: dry run without opening the store.
pub fn plan(path: &Path, environment: Environment, config: &EngineConfig) -> Result<Value, CliError> {
    let spec = load_spec(path)?;
    let report = validate(&spec, environment);
    if !report.is_valid() {
        return Err(CliError::Invalid {
            errors: report.errors,
        });
    }
    let plan = Planner::new(config.default_step_estimate).plan(&spec, environment, report.warnings);
    Ok(serde_json::to_value(plan)?)
}

/// `apply`: execute a spec and fail unless it completes.
pub async fn apply(
    manager: &MigrationManager,
    path: &Path,
    environment: Environment,
) -> Result<Value, CliError> {
    let spec = load_spec(path)?;
    let migration = manager.submit(spec, environment).await?;
    let output = serde_json::to_value(&migration)?;
    if migration.status != MigrationStatus::Completed {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Err(CliError::Failed {
            id: migration.id,
            status: migration.status,
            error: migration.error.unwrap_or_default(),
        });
    }
    Ok(output)
}

/// Open the local store and archive anything a previous run left in flight.
pub async fn open_manager(
    data_path: &Path,
    config: EngineConfig,
) -> Result<MigrationManager, CliError> {
    let backend = Arc::new(SledBackend::open(data_path)?);
    let manager =
        MigrationManager::open(backend, Arc::new(ProcessToolRunner::new()), config).await?;

    let recovered = manager.recover().await?;
    if !recovered.is_empty() {
        tracing::warn!(count = recovered.len(), "archived interrupted migrations as failed");
    }
    Ok(manager)
}
