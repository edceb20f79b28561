//! Controller defaults.

/// Namespace used when a resource or config entry does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Number of reconciliation workers.
pub const DEFAULT_WORKERS: usize = 2;

/// How often a task re-runs its apply cycle, in minutes.
pub const DEFAULT_REFRESH_INTERVAL_MINUTES: u64 = 10;

/// How often the informer relists scaling tasks, in seconds.
pub const DEFAULT_RESYNC_SECS: u64 = 30;

/// Cadence of every metric policy evaluator, in seconds.
pub const DEFAULT_POLICY_INTERVAL_SECS: u64 = 60;

/// Samples older than this are treated as missing, in seconds.
pub const DEFAULT_MAX_SAMPLE_AGE_SECS: u64 = 180;

/// Upper bound on any single state store / metric source call, in seconds.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 10;

/// How long shutdown waits for in-flight cycles, in seconds.
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

/// Initial per-key requeue delay, in milliseconds.
pub const QUEUE_BASE_DELAY_MS: u64 = 5;

/// Maximum per-key requeue delay, in seconds.
pub const QUEUE_MAX_DELAY_SECS: u64 = 1000;

/// Component name stamped on recorded events.
pub const CONTROLLER_AGENT_NAME: &str = "application-auto-scaling-service";

/// Listen address of the `/metrics` and `/healthz` endpoints.
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";

/// Log filter used when neither `RUST_LOG` nor the config sets one.
pub const DEFAULT_LOG_LEVEL: &str = "info";
