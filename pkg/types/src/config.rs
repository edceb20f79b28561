use serde::{Deserialize, Serialize};

use crate::policy::PolicySpec;
use crate::strategy::StrategySource;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Controller configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// data-dir: /var/lib/aas/data
/// cluster-id: c-1
/// workers: 2
/// refresh-interval-minutes: 10
/// utc-offset-minutes: 480
/// strategy-source:
///   remote:
///     url: https://bucket.example.com/strategies/{cluster_id}/{name}.yaml
/// policies:
///   - name: cpu-high
///     target: default/web-hpa
///     metric-name: cpu_utilization
///     comparison-operator: GreaterThanThreshold
///     threshold: 80
///     evaluation-periods: 3
///     adjustment: { type: ChangeInCapacity, value: 2 }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfigFile {
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    #[serde(default, alias = "cluster-id")]
    pub cluster_id: Option<String>,
    /// Namespace used for bare keys and target listing
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default, alias = "refresh-interval-minutes")]
    pub refresh_interval_minutes: Option<u64>,
    #[serde(default, alias = "resync-seconds")]
    pub resync_seconds: Option<u64>,
    #[serde(default, alias = "policy-interval-seconds")]
    pub policy_interval_seconds: Option<u64>,
    #[serde(default, alias = "max-sample-age-seconds")]
    pub max_sample_age_seconds: Option<u64>,
    #[serde(default, alias = "call-timeout-seconds")]
    pub call_timeout_seconds: Option<u64>,
    #[serde(default, alias = "shutdown-grace-seconds")]
    pub shutdown_grace_seconds: Option<u64>,
    /// Offset of the schedule's wall clock from UTC; local time when unset
    #[serde(default, alias = "utc-offset-minutes")]
    pub utc_offset_minutes: Option<i32>,
    #[serde(default, alias = "metrics-addr")]
    pub metrics_addr: Option<String>,
    #[serde(default, alias = "log-level")]
    pub log_level: Option<String>,
    #[serde(default, alias = "log-format")]
    pub log_format: Option<LogFormat>,
    #[serde(default, alias = "strategy-source")]
    pub strategy_source: Option<StrategySource>,
    #[serde(default)]
    pub policies: Vec<PolicySpec>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}
