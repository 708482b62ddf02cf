//! Dry-run plans.
//!
//! A plan describes what a submission would do without touching the
//! backend: ordered steps with estimates and per-step risk, the tables that
//! would be backed up, and the rollback procedure if the spec declares one.

use super::risk::{RiskAssessment, RiskCalculator, RiskLevel};
use super::spec::MigrationSpec;
use crate::context::Environment;
use crate::operation::{OperationSpec, OperationType};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedStep {
    pub index: usize,
    pub operation: OperationType,
    /// Author description, or a generated summary.
    pub description: String,
    /// Estimated duration in seconds.
    pub estimated_seconds: u64,
    /// Whether the estimate fell back to the configured default.
    pub estimate_is_default: bool,
    pub risk: RiskLevel,
    pub required: bool,
    pub rollback_supported: bool,
}

/// Result of a dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPlan {
    pub name: String,
    pub version: String,
    pub environment: Environment,
    pub steps: Vec<PlannedStep>,
    pub risk: RiskAssessment,
    /// Sum of step estimates in seconds.
    pub estimated_total_seconds: u64,
    /// Tables a real submission would back up first. Empty when no backup runs.
    pub backup_tables: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_hooks: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_hooks: Vec<String>,
    /// Summaries of the declared rollback operations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rollback: Vec<String>,
    /// Validation advisories.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl MigrationPlan {
    /// Number of steps.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps whose own risk is at least `level`.
    pub fn steps_at_or_above(&self, level: RiskLevel) -> Vec<&PlannedStep> {
        self.steps.iter().filter(|s| s.risk >= level).collect()
    }
}

/// Builds plans from specs.
#[derive(Debug, Clone)]
pub struct Planner {
    default_step_estimate: Duration,
}

impl Planner {
    /// Create a planner using `default_step_estimate` for steps without an estimate.
    pub fn new(default_step_estimate: Duration) -> Self {
        Self {
            default_step_estimate,
        }
    }

    /// Plan `spec` for `environment`. `warnings` are attached as-is.
    pub fn plan(
        &self,
        spec: &MigrationSpec,
        environment: Environment,
        warnings: Vec<String>,
    ) -> MigrationPlan {
        let steps: Vec<PlannedStep> = spec
            .operations
            .iter()
            .enumerate()
            .map(|(index, op)| self.plan_step(index, op))
            .collect();
        let estimated_total_seconds = steps.iter().map(|s| s.estimated_seconds).sum();

        let backup_tables = if spec.backup_required || environment.is_production() {
            spec.referenced_tables()
        } else {
            Vec::new()
        };

        MigrationPlan {
            name: spec.name.clone(),
            version: spec.version.clone(),
            environment,
            risk: RiskCalculator::assess(&spec.operations),
            steps,
            estimated_total_seconds,
            backup_tables,
            pre_hooks: spec.pre_hooks.iter().map(|s| s.name.clone()).collect(),
            post_hooks: spec.post_hooks.iter().map(|s| s.name.clone()).collect(),
            rollback: spec
                .rollback
                .iter()
                .flatten()
                .map(|op| op.operation.summary())
                .collect(),
            warnings,
        }
    }

    fn plan_step(&self, index: usize, op: &OperationSpec) -> PlannedStep {
        let parsed = op
            .estimated_duration
            .as_deref()
            .and_then(parse_duration_estimate);
        let estimate = parsed.unwrap_or(self.default_step_estimate);

        PlannedStep {
            index,
            operation: op.kind(),
            description: op
                .description
                .clone()
                .unwrap_or_else(|| op.operation.summary()),
            estimated_seconds: estimate.as_secs(),
            estimate_is_default: parsed.is_none(),
            risk: RiskLevel::of_weight(RiskCalculator::weight(op.kind())),
            required: op.required,
            rollback_supported: op.rollback_supported,
        }
    }
}

/// Parse a free-text estimate such as `"5m"`, `"30 seconds"`, `"2h"` or `"90"`.
///
/// A bare number is seconds. Returns `None` for anything else.
pub fn parse_duration_estimate(text: &str) -> Option<Duration> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let amount: u64 = number.parse().ok()?;

    let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3600,
        _ => return None,
    };
    amount.checked_mul(multiplier).map(Duration::from_secs)
}
