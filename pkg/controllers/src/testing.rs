//! In-memory collaborators for unit tests.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

use pkg_types::event::EventType;
use pkg_types::hpa::{ScaleTargetRef, ScalingSpec};
use pkg_types::meta::ObjectKey;
use pkg_types::metric::{Dimension, MetricSample};
use pkg_types::strategy::StrategySource;
use pkg_types::task::{ScalingTask, ScalingTaskSpec};

use crate::schedule::Clock;
use crate::store::{EventRecorder, MetricSource, StrategyFetcher, TargetStore, TaskLister};

pub fn spec(min: u32, max: u32) -> ScalingSpec {
    ScalingSpec {
        min_replicas: min,
        max_replicas: max,
        ..Default::default()
    }
}

pub fn at(h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 1)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
}

pub fn task(namespace: &str, name: &str, target: &str) -> ScalingTask {
    ScalingTask {
        id: format!("id-{}", name),
        name: name.to_string(),
        namespace: namespace.to_string(),
        spec: ScalingTaskSpec {
            scale_target_refs: vec![ScaleTargetRef {
                api_version: "autoscaling/v2".to_string(),
                kind: "CustomedHorizontalPodAutoscaler".to_string(),
                name: target.to_string(),
            }],
            refresh_interval_minutes: Some(10),
            strategy_source: Some(StrategySource::Local {
                path: format!("/strategies/{}.yaml", name),
            }),
            policies: Vec::new(),
        },
        resource_version: 1,
        created_at: Utc::now(),
    }
}

/// Strategy document with three windows covering the day.
pub const THREE_WINDOWS: &str = r#"
targetHPA: web
strategies:
  - validTime: "0:00-09:30"
    spec: { minReplicas: 1, maxReplicas: 3 }
  - validTime: "09:30-18:00"
    spec: { minReplicas: 5, maxReplicas: 10 }
  - validTime: "18:00-24:00"
    spec: { minReplicas: 2, maxReplicas: 6 }
"#;

#[derive(Default)]
pub struct FakeTargetStore {
    specs: Mutex<HashMap<ObjectKey, ScalingSpec>>,
    updates: AtomicUsize,
    failing_updates: AtomicUsize,
    failing_gets: AtomicUsize,
    holding_lists: AtomicBool,
    list_entered: Notify,
    list_released: Notify,
}

impl FakeTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(namespace: &str, name: &str, min: u32, max: u32) -> Self {
        let store = Self::new();
        store.insert(ObjectKey::new(namespace, name), spec(min, max));
        store
    }

    pub fn insert(&self, key: ObjectKey, spec: ScalingSpec) {
        self.specs.lock().unwrap().insert(key, spec);
    }

    pub fn spec(&self, key: &ObjectKey) -> ScalingSpec {
        self.specs.lock().unwrap().get(key).cloned().unwrap()
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Fail the next `n` updates.
    pub fn fail_updates(&self, n: usize) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` reads.
    pub fn fail_gets(&self, n: usize) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    /// Park `list_targets` callers until [`Self::release_lists`].
    pub fn hold_lists(&self) {
        self.holding_lists.store(true, Ordering::SeqCst);
    }

    /// Resolves once a caller is parked in `list_targets`.
    pub async fn list_parked(&self) {
        self.list_entered.notified().await;
    }

    pub fn release_lists(&self) {
        self.holding_lists.store(false, Ordering::SeqCst);
        self.list_released.notify_one();
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl TargetStore for FakeTargetStore {
    async fn get_target_spec(&self, target: &ObjectKey) -> anyhow::Result<ScalingSpec> {
        if Self::take_failure(&self.failing_gets) {
            anyhow::bail!("store unavailable");
        }
        self.specs
            .lock()
            .unwrap()
            .get(target)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("target {} not found", target))
    }

    async fn update_target_spec(
        &self,
        target: &ObjectKey,
        spec: ScalingSpec,
    ) -> anyhow::Result<ScalingSpec> {
        if Self::take_failure(&self.failing_updates) {
            anyhow::bail!("store unavailable");
        }
        let mut specs = self.specs.lock().unwrap();
        if !specs.contains_key(target) {
            anyhow::bail!("target {} not found", target);
        }
        specs.insert(target.clone(), spec.clone());
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(spec)
    }

    async fn list_targets(&self, namespace: &str) -> anyhow::Result<Vec<ObjectKey>> {
        if self.holding_lists.load(Ordering::SeqCst) {
            self.list_entered.notify_one();
            self.list_released.notified().await;
        }
        let mut keys: Vec<ObjectKey> = self
            .specs
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.namespace == namespace)
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// One scripted answer of [`FakeMetrics`].
pub enum Reading {
    Value(f64),
    Stale(f64),
    Missing,
    Error,
}

/// Metric source replaying a script; answers `Missing` once it runs out.
#[derive(Default)]
pub struct FakeMetrics {
    script: Mutex<VecDeque<Reading>>,
    calls: AtomicUsize,
}

impl FakeMetrics {
    pub fn new(script: impl IntoIterator<Item = Reading>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn values(values: &[f64]) -> Self {
        Self::new(values.iter().map(|v| Reading::Value(*v)))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricSource for FakeMetrics {
    async fn latest_sample(
        &self,
        metric_name: &str,
        dimensions: &[Dimension],
    ) -> anyhow::Result<Option<MetricSample>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reading = self.script.lock().unwrap().pop_front().unwrap_or(Reading::Missing);
        let sample = |value: f64, age: chrono::Duration| MetricSample {
            metric_name: metric_name.to_string(),
            dimensions: dimensions.to_vec(),
            value,
            unit: None,
            timestamp: Utc::now() - age,
        };
        match reading {
            Reading::Value(v) => Ok(Some(sample(v, chrono::Duration::zero()))),
            Reading::Stale(v) => Ok(Some(sample(v, chrono::Duration::hours(1)))),
            Reading::Missing => Ok(None),
            Reading::Error => Err(anyhow::anyhow!("metrics backend unavailable")),
        }
    }
}

/// Fetcher serving fixed content for every source.
#[derive(Default)]
pub struct FakeFetcher {
    content: Mutex<Option<Vec<u8>>>,
    fetched: Mutex<Vec<StrategySource>>,
}

impl FakeFetcher {
    pub fn serving(content: &str) -> Self {
        let fetcher = Self::default();
        fetcher.set(content);
        fetcher
    }

    pub fn set(&self, content: &str) {
        *self.content.lock().unwrap() = Some(content.as_bytes().to_vec());
    }

    /// Make every fetch fail.
    pub fn break_source(&self) {
        *self.content.lock().unwrap() = None;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetched.lock().unwrap().len()
    }

    pub fn last_source(&self) -> Option<StrategySource> {
        self.fetched.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl StrategyFetcher for FakeFetcher {
    async fn fetch(&self, source: &StrategySource) -> anyhow::Result<Vec<u8>> {
        self.fetched.lock().unwrap().push(source.clone());
        self.content
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("source {} unreachable", source))
    }
}

#[derive(Default)]
pub struct FakeLister {
    tasks: Mutex<HashMap<ObjectKey, ScalingTask>>,
}

impl FakeLister {
    pub fn insert(&self, task: ScalingTask) {
        self.tasks.lock().unwrap().insert(task.key(), task);
    }

    pub fn remove(&self, key: &ObjectKey) {
        self.tasks.lock().unwrap().remove(key);
    }
}

#[async_trait]
impl TaskLister for FakeLister {
    async fn get_task(&self, key: &ObjectKey) -> anyhow::Result<Option<ScalingTask>> {
        Ok(self.tasks.lock().unwrap().get(key).cloned())
    }

    async fn list_tasks(&self) -> anyhow::Result<Vec<ScalingTask>> {
        Ok(self.tasks.lock().unwrap().values().cloned().collect())
    }
}

/// Recorder that keeps every event for inspection.
#[derive(Default)]
pub struct RecordingRecorder {
    events: Mutex<Vec<(ObjectKey, EventType, String)>>,
}

impl RecordingRecorder {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, reason)| reason.clone())
            .collect()
    }

    pub fn count(&self, reason: &str) -> usize {
        self.reasons().iter().filter(|r| *r == reason).count()
    }
}

#[async_trait]
impl EventRecorder for RecordingRecorder {
    async fn record(&self, object: &ObjectKey, event_type: EventType, reason: &str, _message: &str) {
        self.events
            .lock()
            .unwrap()
            .push((object.clone(), event_type, reason.to_string()));
    }
}

/// Clock that only moves when told to.
pub struct FixedClock {
    now: Mutex<NaiveDateTime>,
}

impl FixedClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock().unwrap() = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap()
    }
}
