//! Narrow interfaces to the collaborators the controllers depend on.
//!
//! Production implementations live in [`crate::registry`]; tests use in-memory
//! fakes.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use pkg_types::event::EventType;
use pkg_types::hpa::ScalingSpec;
use pkg_types::meta::ObjectKey;
use pkg_types::metric::{Dimension, MetricSample};
use pkg_types::strategy::StrategySource;
use pkg_types::task::ScalingTask;

use crate::error::ScalingError;

/// Read and replace the spec of scaling targets.
#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn get_target_spec(&self, target: &ObjectKey) -> anyhow::Result<ScalingSpec>;

    /// Full replace, not a partial patch. Returns the stored spec.
    async fn update_target_spec(
        &self,
        target: &ObjectKey,
        spec: ScalingSpec,
    ) -> anyhow::Result<ScalingSpec>;

    async fn list_targets(&self, namespace: &str) -> anyhow::Result<Vec<ObjectKey>>;
}

/// Most recent observation of a metric series.
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn latest_sample(
        &self,
        metric_name: &str,
        dimensions: &[Dimension],
    ) -> anyhow::Result<Option<MetricSample>>;
}

/// Point lookups of scaling task resources.
#[async_trait]
pub trait TaskLister: Send + Sync {
    async fn get_task(&self, key: &ObjectKey) -> anyhow::Result<Option<ScalingTask>>;
    async fn list_tasks(&self) -> anyhow::Result<Vec<ScalingTask>>;
}

/// Raw bytes of a strategy source.
#[async_trait]
pub trait StrategyFetcher: Send + Sync {
    async fn fetch(&self, source: &StrategySource) -> anyhow::Result<Vec<u8>>;
}

/// Best-effort events attached to an object.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, object: &ObjectKey, event_type: EventType, reason: &str, message: &str);
}

/// Run a collaborator call with an upper bound on its duration.
pub async fn bounded<T, F>(what: &str, after: Duration, fut: F) -> Result<T, ScalingError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result.map_err(ScalingError::Transient),
        Err(_) => Err(ScalingError::Timeout {
            what: what.to_string(),
            after,
        }),
    }
}
