use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

use pkg_constants::controller::{
    DEFAULT_CALL_TIMEOUT_SECS, DEFAULT_LOG_LEVEL, DEFAULT_MAX_SAMPLE_AGE_SECS,
    DEFAULT_METRICS_ADDR, DEFAULT_NAMESPACE, DEFAULT_POLICY_INTERVAL_SECS,
    DEFAULT_REFRESH_INTERVAL_MINUTES, DEFAULT_RESYNC_SECS, DEFAULT_SHUTDOWN_GRACE_SECS,
    DEFAULT_WORKERS,
};
use pkg_constants::paths::{DEFAULT_CONTROLLER_CONFIG, DEFAULT_DATA_DIR};
use pkg_types::config::{ControllerConfigFile, LogFormat};
use pkg_types::policy::PolicySpec;
use pkg_types::strategy::StrategySource;

#[derive(Parser, Debug, Default)]
#[command(
    name = "aas-controller",
    about = "Time-windowed and metric-threshold autoscaling controller"
)]
pub struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_CONTROLLER_CONFIG)]
    pub config: String,

    /// Directory for SlateDB state storage
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Cluster identifier substituted into strategy source templates
    #[arg(long)]
    pub cluster_id: Option<String>,

    #[arg(long)]
    pub namespace: Option<String>,

    /// Number of reconciliation workers
    #[arg(long)]
    pub workers: Option<usize>,

    #[arg(long)]
    pub refresh_interval_minutes: Option<u64>,

    #[arg(long)]
    pub resync_seconds: Option<u64>,

    #[arg(long)]
    pub policy_interval_seconds: Option<u64>,

    #[arg(long)]
    pub max_sample_age_seconds: Option<u64>,

    #[arg(long)]
    pub call_timeout_seconds: Option<u64>,

    #[arg(long)]
    pub shutdown_grace_seconds: Option<u64>,

    /// Schedule clock offset from UTC; local time when unset
    #[arg(long, allow_hyphen_values = true)]
    pub utc_offset_minutes: Option<i32>,

    /// Listen address for the API, /metrics and /healthz
    #[arg(long)]
    pub metrics_addr: Option<String>,

    #[arg(long)]
    pub log_level: Option<String>,

    /// `text` or `json`
    #[arg(long)]
    pub log_format: Option<String>,

    /// Default strategy source: an http(s) URL or a local path
    #[arg(long)]
    pub strategy_source: Option<String>,
}

/// Effective controller settings after merging CLI > config file > defaults.
#[derive(Debug)]
pub struct Settings {
    pub data_dir: String,
    pub cluster_id: String,
    pub namespace: String,
    pub workers: usize,
    pub refresh_interval: Duration,
    pub resync: Duration,
    pub policy_interval: Duration,
    pub max_sample_age: Duration,
    pub call_timeout: Duration,
    pub shutdown_grace: Duration,
    pub utc_offset_minutes: Option<i32>,
    pub metrics_addr: SocketAddr,
    pub log_level: String,
    pub log_format: LogFormat,
    pub strategy_source: Option<StrategySource>,
    pub policies: Vec<PolicySpec>,
}

impl Settings {
    pub fn resolve(cli: Cli, file: ControllerConfigFile) -> anyhow::Result<Self> {
        let log_format = match cli.log_format.as_deref() {
            Some("json") => LogFormat::Json,
            Some("text") => LogFormat::Text,
            Some(other) => anyhow::bail!("unknown log format '{}'", other),
            None => file.log_format.unwrap_or_default(),
        };
        let metrics_addr = cli
            .metrics_addr
            .or(file.metrics_addr)
            .unwrap_or_else(|| DEFAULT_METRICS_ADDR.to_string());
        let metrics_addr: SocketAddr = metrics_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid metrics address '{}': {}", metrics_addr, e))?;
        let workers = cli.workers.or(file.workers).unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        let refresh_minutes = cli
            .refresh_interval_minutes
            .or(file.refresh_interval_minutes)
            .unwrap_or(DEFAULT_REFRESH_INTERVAL_MINUTES);
        if refresh_minutes == 0 {
            anyhow::bail!("refresh-interval-minutes must be at least 1");
        }
        let secs = |cli: Option<u64>, file: Option<u64>, default: u64| {
            Duration::from_secs(cli.or(file).unwrap_or(default).max(1))
        };

        Ok(Self {
            data_dir: cli
                .data_dir
                .or(file.data_dir)
                .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
            cluster_id: cli.cluster_id.or(file.cluster_id).unwrap_or_default(),
            namespace: cli
                .namespace
                .or(file.namespace)
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            workers,
            refresh_interval: Duration::from_secs(refresh_minutes * 60),
            resync: secs(cli.resync_seconds, file.resync_seconds, DEFAULT_RESYNC_SECS),
            policy_interval: secs(
                cli.policy_interval_seconds,
                file.policy_interval_seconds,
                DEFAULT_POLICY_INTERVAL_SECS,
            ),
            max_sample_age: secs(
                cli.max_sample_age_seconds,
                file.max_sample_age_seconds,
                DEFAULT_MAX_SAMPLE_AGE_SECS,
            ),
            call_timeout: secs(
                cli.call_timeout_seconds,
                file.call_timeout_seconds,
                DEFAULT_CALL_TIMEOUT_SECS,
            ),
            shutdown_grace: secs(
                cli.shutdown_grace_seconds,
                file.shutdown_grace_seconds,
                DEFAULT_SHUTDOWN_GRACE_SECS,
            ),
            utc_offset_minutes: cli.utc_offset_minutes.or(file.utc_offset_minutes),
            metrics_addr,
            log_level: cli
                .log_level
                .or(file.log_level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            log_format,
            strategy_source: cli
                .strategy_source
                .map(|s| parse_source(&s))
                .or(file.strategy_source),
            policies: file.policies,
        })
    }
}

fn parse_source(value: &str) -> StrategySource {
    if value.starts_with("http://") || value.starts_with("https://") {
        StrategySource::Remote {
            url: value.to_string(),
        }
    } else {
        StrategySource::Local {
            path: value.to_string(),
        }
    }
}
