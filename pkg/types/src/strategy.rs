use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hpa::ScalingSpec;

/// One time-of-day interval and the spec that should be in force during it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyWindow {
    /// `HH:MM-HH:MM`, e.g. `0:00-09:30`
    #[serde(alias = "validTime")]
    pub valid_time: String,
    pub spec: ScalingSpec,
}

/// A complete set of windows, loaded and replaced as a unit.
///
/// Accepts both the snake_case layout and the camelCase one used by
/// `strategies.yaml` files:
/// ```yaml
/// clusterId: c-1
/// createTime: 1700000000000
/// targetHPA: web-hpa
/// strategies:
///   - validTime: "0:00-09:30"
///     spec: { minReplicas: 1, maxReplicas: 3 }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategySet {
    #[serde(default, alias = "clusterId")]
    pub cluster_id: Option<String>,
    /// Creation timestamp in milliseconds
    #[serde(default, alias = "createTime")]
    pub create_time: i64,
    /// Name of the scaling target these windows were written for
    #[serde(default, alias = "targetHPA")]
    pub target_hpa: Option<String>,
    #[serde(default)]
    pub strategies: Vec<StrategyWindow>,
}

impl StrategySet {
    /// Parse raw source bytes. JSON documents are valid YAML, so both work.
    pub fn from_slice(bytes: &[u8]) -> anyhow::Result<Self> {
        let set: StrategySet = serde_yaml::from_slice(bytes)?;
        Ok(set)
    }
}

/// Where a strategy set is fetched from.
///
/// Paths and URLs may contain `{cluster_id}`, `{namespace}` and `{name}`
/// placeholders, filled in per scaling task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategySource {
    Local { path: String },
    Remote { url: String },
}

impl StrategySource {
    pub fn render(&self, cluster_id: &str, namespace: &str, name: &str) -> Self {
        let fill = |s: &str| {
            s.replace("{cluster_id}", cluster_id)
                .replace("{namespace}", namespace)
                .replace("{name}", name)
        };
        match self {
            StrategySource::Local { path } => StrategySource::Local { path: fill(path) },
            StrategySource::Remote { url } => StrategySource::Remote { url: fill(url) },
        }
    }
}

impl fmt::Display for StrategySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategySource::Local { path } => write!(f, "file://{}", path),
            StrategySource::Remote { url } => write!(f, "{}", url),
        }
    }
}
