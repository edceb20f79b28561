//! State-store backed implementations of the controller collaborators.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use pkg_constants::controller::CONTROLLER_AGENT_NAME;
use pkg_constants::state::{
    EVENT_PREFIX, METRIC_SAMPLE_PREFIX, SCALING_TARGET_PREFIX, SCALING_TASK_PREFIX,
};
use pkg_state::client::StateStore;
use pkg_types::event::{Event, EventType};
use pkg_types::hpa::{CustomedHorizontalPodAutoscaler, ScalingSpec};
use pkg_types::meta::ObjectKey;
use pkg_types::metric::{Dimension, MetricSample, dimension_key};
use pkg_types::task::ScalingTask;

use crate::store::{EventRecorder, MetricSource, TargetStore, TaskLister};

pub fn task_path(key: &ObjectKey) -> String {
    format!("{}{}/{}", SCALING_TASK_PREFIX, key.namespace, key.name)
}

pub fn target_path(key: &ObjectKey) -> String {
    format!("{}{}/{}", SCALING_TARGET_PREFIX, key.namespace, key.name)
}

/// Events of one object; each reason keeps a single, aggregated entry.
pub fn event_prefix(object: &ObjectKey) -> String {
    format!("{}{}/{}/", EVENT_PREFIX, object.namespace, object.name)
}

pub fn metric_path(metric_name: &str, dimensions: &[Dimension]) -> String {
    format!(
        "{}{}/{}",
        METRIC_SAMPLE_PREFIX,
        metric_name,
        dimension_key(dimensions)
    )
}

/// Object key of a stored path under `prefix`, if it has the `{ns}/{name}` shape.
pub fn key_from_path(prefix: &str, path: &str) -> Option<ObjectKey> {
    let rest = path.strip_prefix(prefix)?;
    let (namespace, name) = rest.split_once('/')?;
    if namespace.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some(ObjectKey::new(namespace, name))
}

/// Scaling tasks, targets, metric samples and events kept in the [`StateStore`].
///
/// Every write of a task or target bumps its `resource_version`.
#[derive(Clone)]
pub struct Registry {
    store: StateStore,
}

impl Registry {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    async fn read<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<Option<T>> {
        match self.store.get(path).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("decode {}", path))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn write<T: Serialize>(&self, path: &str, value: &T) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.store.put(path, &bytes).await
    }

    async fn list<T: DeserializeOwned>(&self, prefix: &str) -> anyhow::Result<Vec<T>> {
        let entries = self.store.list_prefix(prefix).await?;
        let mut values = Vec::with_capacity(entries.len());
        for (key, bytes) in entries {
            match serde_json::from_slice(&bytes) {
                Ok(v) => values.push(v),
                Err(e) => warn!("Skipping undecodable entry {}: {}", key, e),
            }
        }
        Ok(values)
    }

    /// Create or replace a scaling task. An existing task keeps its id and
    /// creation time.
    pub async fn put_task(&self, mut task: ScalingTask) -> anyhow::Result<ScalingTask> {
        let path = task_path(&task.key());
        task.resource_version = match self.read::<ScalingTask>(&path).await? {
            Some(existing) => {
                task.id = existing.id;
                task.created_at = existing.created_at;
                existing.resource_version + 1
            }
            None => 1,
        };
        self.write(&path, &task).await?;
        Ok(task)
    }

    /// Delete a task and its events. Returns whether a task was deleted.
    pub async fn delete_task(&self, key: &ObjectKey) -> anyhow::Result<bool> {
        let path = task_path(key);
        if self.store.get(&path).await?.is_none() {
            return Ok(false);
        }
        self.store.delete(&path).await?;
        for event in self.store.list_keys(&event_prefix(key)).await? {
            self.store.delete(&event).await?;
        }
        Ok(true)
    }

    /// Create or replace a scaling target, keeping the id and creation time
    /// of an existing one.
    pub async fn put_target(
        &self,
        mut target: CustomedHorizontalPodAutoscaler,
    ) -> anyhow::Result<CustomedHorizontalPodAutoscaler> {
        let path = target_path(&target.key());
        target.resource_version = match self
            .read::<CustomedHorizontalPodAutoscaler>(&path)
            .await?
        {
            Some(existing) => {
                target.id = existing.id;
                target.created_at = existing.created_at;
                existing.resource_version + 1
            }
            None => 1,
        };
        self.write(&path, &target).await?;
        Ok(target)
    }

    pub async fn get_target(
        &self,
        key: &ObjectKey,
    ) -> anyhow::Result<Option<CustomedHorizontalPodAutoscaler>> {
        self.read(&target_path(key)).await
    }

    /// Store a sample as the latest of its series.
    pub async fn put_metric_sample(&self, sample: &MetricSample) -> anyhow::Result<()> {
        self.write(&metric_path(&sample.metric_name, &sample.dimensions), sample)
            .await
    }

    /// Events of a namespace, oldest first.
    pub async fn list_events(&self, namespace: &str) -> anyhow::Result<Vec<Event>> {
        let mut events: Vec<Event> = self
            .list(&format!("{}{}/", EVENT_PREFIX, namespace))
            .await?;
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}

#[async_trait]
impl TargetStore for Registry {
    async fn get_target_spec(&self, target: &ObjectKey) -> anyhow::Result<ScalingSpec> {
        self.get_target(target)
            .await?
            .map(|t| t.spec)
            .ok_or_else(|| anyhow::anyhow!("scaling target {} not found", target))
    }

    async fn update_target_spec(
        &self,
        target: &ObjectKey,
        spec: ScalingSpec,
    ) -> anyhow::Result<ScalingSpec> {
        let mut existing = self
            .get_target(target)
            .await?
            .ok_or_else(|| anyhow::anyhow!("scaling target {} not found", target))?;
        existing.spec = spec;
        let stored = self.put_target(existing).await?;
        Ok(stored.spec)
    }

    async fn list_targets(&self, namespace: &str) -> anyhow::Result<Vec<ObjectKey>> {
        let prefix = format!("{}{}/", SCALING_TARGET_PREFIX, namespace);
        let paths = self.store.list_keys(&prefix).await?;
        Ok(paths
            .iter()
            .filter_map(|path| key_from_path(SCALING_TARGET_PREFIX, path))
            .collect())
    }
}

#[async_trait]
impl MetricSource for Registry {
    async fn latest_sample(
        &self,
        metric_name: &str,
        dimensions: &[Dimension],
    ) -> anyhow::Result<Option<MetricSample>> {
        self.read(&metric_path(metric_name, dimensions)).await
    }
}

#[async_trait]
impl TaskLister for Registry {
    async fn get_task(&self, key: &ObjectKey) -> anyhow::Result<Option<ScalingTask>> {
        self.read(&task_path(key)).await
    }

    async fn list_tasks(&self) -> anyhow::Result<Vec<ScalingTask>> {
        self.list(SCALING_TASK_PREFIX).await
    }
}

#[async_trait]
impl EventRecorder for Registry {
    async fn record(&self, object: &ObjectKey, event_type: EventType, reason: &str, message: &str) {
        let now = Utc::now();
        let mut event = Event {
            id: uuid::Uuid::new_v4().to_string(),
            namespace: object.namespace.clone(),
            involved_object: object.to_string(),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
            source: CONTROLLER_AGENT_NAME.to_string(),
            count: 1,
            first_timestamp: now,
            timestamp: now,
        };
        let path = format!("{}{}", event_prefix(object), reason);
        match self.read::<Event>(&path).await {
            Ok(Some(previous)) if event.repeats(&previous) => {
                event.id = previous.id;
                event.count = previous.count.saturating_add(1);
                event.first_timestamp = previous.first_timestamp;
            }
            Ok(_) => {}
            Err(e) => debug!("Replacing unreadable event {}: {}", path, e),
        }
        if let Err(e) = self.write(&path, &event).await {
            warn!("Failed to record {} event on {}: {}", reason, object, e);
        }
    }
}
