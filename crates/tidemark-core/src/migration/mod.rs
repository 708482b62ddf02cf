//! Migration engine.
//!
//! A [`MigrationSpec`] is validated, admitted by the [`MigrationManager`]
//! under a concurrency ceiling, executed operation by operation through the
//! [`OperationRegistry`](crate::operation::OperationRegistry), and archived
//! to the history store once it reaches a terminal status.
//!
//! # Risk levels
//!
//! | Operation | Weight |
//! |-----------|--------|
//! | `deleteTable`, `deleteGSI` | 3 |
//! | `migrateData`, `transformData` | 2 |
//! | `createTable`, `modifyTable` | 1 |
//! | everything else | 0 |
//!
//! A total of 5 or more is high risk, 2 or more medium, anything less low.
//! Risk is advisory and never blocks a submission.
//!
//! # Example
//!
//! ```ignore
//! use tidemark_core::migration::{MigrationManager, MigrationSpec};
//!
//! let manager = MigrationManager::open(backend, tools, config).await?;
//! let spec = MigrationSpec::from_json(&text)?;
//!
//! let plan = manager.dry_run(&spec, Environment::Production)?;
//! println!("risk: {}", plan.risk.level);
//!
//! let migration = manager.submit(spec, Environment::Production).await?;
//! ```

pub mod error;
pub mod manager;
pub mod plan;
pub mod risk;
pub mod spec;
pub mod state;
pub mod validate;

pub use error::{HookStage, MigrationError};
pub use manager::{
    MigrationHandle, MigrationManager, StatusReport, SubmitRequest, SubmitResponse,
};
pub use plan::{parse_duration_estimate, MigrationPlan, PlannedStep, Planner};
pub use risk::{RiskAssessment, RiskCalculator, RiskFactor, RiskLevel};
pub use spec::MigrationSpec;
pub use state::{BackupRef, Migration, MigrationStatus, OperationResult, ResultStatus};
pub use validate::{is_semver, validate, ValidationReport};
