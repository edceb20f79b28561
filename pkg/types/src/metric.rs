use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

impl Dimension {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One observation of a metric series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric_name: String,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Stable, order-independent key for a dimension set, e.g. `fleet=f-1,zone=a`.
/// An empty set maps to `_`.
pub fn dimension_key(dimensions: &[Dimension]) -> String {
    if dimensions.is_empty() {
        return "_".to_string();
    }
    let mut sorted: Vec<&Dimension> = dimensions.iter().collect();
    sorted.sort();
    sorted
        .iter()
        .map(|d| format!("{}={}", d.name, d.value))
        .collect::<Vec<_>>()
        .join(",")
}
