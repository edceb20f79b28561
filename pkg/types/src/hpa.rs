use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::meta::ObjectKey;

// --- Scale target reference ---

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleTargetRef {
    #[serde(default, alias = "apiVersion")]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub name: String,
}

// --- Rules ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricTrigger {
    #[serde(default, alias = "metricName")]
    pub metric_name: String,
    #[serde(default, alias = "metricValue")]
    pub metric_value: Option<f64>,
    /// Comparison symbol, e.g. `>` or `<`
    #[serde(default, alias = "metricOperation")]
    pub metric_operation: String,
    #[serde(default, alias = "periodSeconds")]
    pub period_seconds: Option<u32>,
    #[serde(default, alias = "hitThreshold")]
    pub hit_threshold: Option<u32>,
    #[serde(default)]
    pub statistic: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleAction {
    /// Metric interval this action applies to, e.g. `0.80,+Infinity`
    #[serde(default, alias = "metricRange")]
    pub metric_range: Option<String>,
    #[serde(default, alias = "operationType")]
    pub operation_type: String,
    #[serde(default, alias = "operationUnit")]
    pub operation_unit: Option<String>,
    #[serde(default, alias = "operationValue")]
    pub operation_value: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalingRule {
    #[serde(default, alias = "ruleName")]
    pub rule_name: String,
    #[serde(default, alias = "ruleType")]
    pub rule_type: String,
    #[serde(default)]
    pub disable: bool,
    #[serde(default, alias = "metricTrigger")]
    pub metric_trigger: MetricTrigger,
    #[serde(default)]
    pub actions: Vec<RuleAction>,
}

// --- Scaling spec ---

/// Desired replica bounds and rules of a scaling target.
/// Always replaced wholesale, never patched field by field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalingSpec {
    #[serde(alias = "minReplicas")]
    pub min_replicas: u32,
    #[serde(alias = "maxReplicas")]
    pub max_replicas: u32,
    #[serde(default, alias = "scaleTargetRef")]
    pub scale_target_ref: ScaleTargetRef,
    #[serde(default)]
    pub rules: Vec<ScalingRule>,
}

// --- Customed HPA ---

/// The custom horizontal-scaler object whose spec this controller drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomedHorizontalPodAutoscaler {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub spec: ScalingSpec,
    /// Bumped on every write
    #[serde(default)]
    pub resource_version: u64,
    pub created_at: DateTime<Utc>,
}

impl CustomedHorizontalPodAutoscaler {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }
}
