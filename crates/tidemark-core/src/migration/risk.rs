//! Risk scoring for migration specs.
//!
//! Each operation type carries a fixed weight; the total decides the level.
//! Scores are advisory and never block submission.

use crate::operation::{OperationSpec, OperationType};
use serde::{Deserialize, Serialize};

/// Total score at or above which a migration is high risk.
pub const HIGH_RISK_THRESHOLD: u32 = 5;

/// Total score at or above which a migration is medium risk.
pub const MEDIUM_RISK_THRESHOLD: u32 = 2;

/// Advisory risk level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Level for a total score.
    pub fn from_score(score: u32) -> Self {
        if score >= HIGH_RISK_THRESHOLD {
            RiskLevel::High
        } else if score >= MEDIUM_RISK_THRESHOLD {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// Level of a single operation weight.
    pub fn of_weight(weight: u32) -> Self {
        match weight {
            0 | 1 => RiskLevel::Low,
            2 => RiskLevel::Medium,
            _ => RiskLevel::High,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// One operation that contributed to the score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskFactor {
    pub index: usize,
    pub operation: OperationType,
    pub weight: u32,
}

/// Aggregate risk of a list of operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub score: u32,
    pub level: RiskLevel,
    /// Operations with a non-zero weight, in list order.
    pub factors: Vec<RiskFactor>,
}

/// Scores operation lists.
pub struct RiskCalculator;

impl RiskCalculator {
    /// Weight of one operation type.
    pub fn weight(kind: OperationType) -> u32 {
        match kind {
            OperationType::DeleteTable | OperationType::DeleteGsi => 3,
            OperationType::MigrateData | OperationType::TransformData => 2,
            OperationType::CreateTable | OperationType::ModifyTable => 1,
            OperationType::CreateGsi
            | OperationType::SeedData
            | OperationType::CreateBackup
            | OperationType::RestoreBackup
            | OperationType::EnableStreams
            | OperationType::EnablePointInTimeRecovery
            | OperationType::AddTags
            | OperationType::EnableEncryption
            | OperationType::CustomScript
            | OperationType::ToolChain => 0,
        }
    }

    /// Score a list of operations.
    pub fn assess(operations: &[OperationSpec]) -> RiskAssessment {
        let factors: Vec<RiskFactor> = operations
            .iter()
            .enumerate()
            .filter_map(|(index, spec)| {
                let weight = Self::weight(spec.kind());
                (weight > 0).then(|| RiskFactor {
                    index,
                    operation: spec.kind(),
                    weight,
                })
            })
            .collect();
        let score = factors.iter().map(|f| f.weight).sum();

        RiskAssessment {
            score,
            level: RiskLevel::from_score(score),
            factors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{DeleteIndex, DeleteTable, Operation, SeedData};

    fn delete_table() -> OperationSpec {
        OperationSpec::new(Operation::DeleteTable(DeleteTable {
            table_name: "users".into(),
            confirmation: None,
        }))
    }

    fn delete_index() -> OperationSpec {
        OperationSpec::new(Operation::DeleteGsi(DeleteIndex {
            table_name: "users".into(),
            index_name: "by_email".into(),
        }))
    }

    #[test]
    fn test_levels() {
        assert_eq!(RiskCalculator::assess(&[]).level, RiskLevel::Low);
        assert_eq!(RiskCalculator::assess(&[delete_table()]).level, RiskLevel::Medium);

        let both = RiskCalculator::assess(&[delete_table(), delete_index()]);
        assert_eq!(both.score, 6);
        assert_eq!(both.level, RiskLevel::High);
        assert_eq!(both.factors.len(), 2);
    }

    #[test]
    fn test_zero_weight_operations_are_not_factors() {
        let seed = OperationSpec::new(Operation::SeedData(SeedData {
            table_name: "users".into(),
            items: Vec::new(),
        }));
        let assessment = RiskCalculator::assess(&[seed, delete_table()]);
        assert_eq!(assessment.score, 3);
        assert_eq!(assessment.factors[0].index, 1);
    }

    #[test]
    fn test_thresholds() {
        assert_eq!(RiskLevel::from_score(1), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(2), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(4), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(5), RiskLevel::High);
        assert!(RiskLevel::High > RiskLevel::Low);
    }
}
