use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hpa::ScaleTargetRef;
use crate::meta::ObjectKey;
use crate::policy::PolicySpec;
use crate::strategy::StrategySource;

// --- ScalingTask spec ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalingTaskSpec {
    /// Targets to manage. Only the first entry is driven.
    #[serde(default, alias = "scaleTargetRefs")]
    pub scale_target_refs: Vec<ScaleTargetRef>,
    /// Apply-cycle period in minutes; falls back to the controller default.
    #[serde(default, alias = "refreshIntervalMinutes", alias = "forecastWindow")]
    pub refresh_interval_minutes: Option<u32>,
    /// Overrides the controller-wide strategy source.
    #[serde(default, alias = "strategySource")]
    pub strategy_source: Option<StrategySource>,
    /// Metric policies bound to this task's target.
    #[serde(default)]
    pub policies: Vec<PolicySpec>,
}

// --- ScalingTask ---

/// Custom resource that asks the controller to manage one scaling target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingTask {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub spec: ScalingTaskSpec,
    /// Bumped on every write; unchanged versions are not reconciled again
    #[serde(default)]
    pub resource_version: u64,
    pub created_at: DateTime<Utc>,
}

impl ScalingTask {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    /// Key of the scaling target this task drives, in the task's namespace.
    pub fn target_key(&self) -> Option<ObjectKey> {
        self.spec
            .scale_target_refs
            .first()
            .map(|r| ObjectKey::new(&self.namespace, &r.name))
    }
}
