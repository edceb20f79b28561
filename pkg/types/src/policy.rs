use serde::{Deserialize, Serialize};
use std::fmt;

use crate::metric::Dimension;

// --- Comparison ---

/// How a metric sample is compared against a policy threshold.
/// Any other value fails deserialization of the policy definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    GreaterThanThreshold,
    GreaterThanOrEqualToThreshold,
    LessThanThreshold,
    LessThanOrEqualToThreshold,
}

impl ComparisonOperator {
    /// Whether `value` satisfies the operator against `threshold`.
    pub fn is_satisfied(self, value: f64, threshold: f64) -> bool {
        match self {
            ComparisonOperator::GreaterThanThreshold => value > threshold,
            ComparisonOperator::GreaterThanOrEqualToThreshold => value >= threshold,
            ComparisonOperator::LessThanThreshold => value < threshold,
            ComparisonOperator::LessThanOrEqualToThreshold => value <= threshold,
        }
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            ComparisonOperator::GreaterThanThreshold => ">",
            ComparisonOperator::GreaterThanOrEqualToThreshold => ">=",
            ComparisonOperator::LessThanThreshold => "<",
            ComparisonOperator::LessThanOrEqualToThreshold => "<=",
        };
        write!(f, "{}", symbol)
    }
}

// --- Adjustment ---

/// Scaling adjustment carried by a policy, written as
/// `{ type: ChangeInCapacity, value: 2 }` in config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ScalingAdjustment {
    /// Add (positive) or remove (negative) this many instances.
    ChangeInCapacity(i32),
    /// Set capacity to exactly this many instances.
    ExactCapacity(u32),
    /// Change capacity by this percentage of the current value.
    PercentChangeInCapacity(i32),
}

impl fmt::Display for ScalingAdjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalingAdjustment::ChangeInCapacity(v) => write!(f, "ChangeInCapacity({})", v),
            ScalingAdjustment::ExactCapacity(v) => write!(f, "ExactCapacity({})", v),
            ScalingAdjustment::PercentChangeInCapacity(v) => {
                write!(f, "PercentChangeInCapacity({})", v)
            }
        }
    }
}

// --- Policy spec ---

/// Definition of a metric-threshold scaling policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySpec {
    pub name: String,
    /// Target key (`namespace/name`). Policies declared on a scaling task
    /// default to that task's target.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(alias = "metricName", alias = "metric-name")]
    pub metric_name: String,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    #[serde(alias = "comparisonOperator", alias = "comparison-operator")]
    pub comparison_operator: ComparisonOperator,
    pub threshold: f64,
    /// Consecutive satisfied evaluations required before acting
    #[serde(alias = "evaluationPeriods", alias = "evaluation-periods")]
    pub evaluation_periods: u32,
    pub adjustment: ScalingAdjustment,
}
