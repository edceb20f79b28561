//! State store key layout.
//!
//! Every object lives under `/registry/<kind>/...` so it can be listed with a
//! single prefix scan, matching the etcd-style layout.

/// Prefix for `ScalingTask` custom resources: `/registry/scalingtasks/{ns}/{name}`.
pub const SCALING_TASK_PREFIX: &str = "/registry/scalingtasks/";

/// Prefix for scaling targets (customed HPAs): `/registry/chpa/{ns}/{name}`.
pub const SCALING_TARGET_PREFIX: &str = "/registry/chpa/";

/// Prefix for the latest metric sample per series: `/registry/metrics/{metric}/{dimension-key}`.
pub const METRIC_SAMPLE_PREFIX: &str = "/registry/metrics/";

/// Prefix for recorded events: `/registry/events/{ns}/{name}/{reason}`.
pub const EVENT_PREFIX: &str = "/registry/events/";

/// How many watch events a subscriber may lag behind before missing some.
pub const EVENT_LOG_CAPACITY: usize = 1024;
