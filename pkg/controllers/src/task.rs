use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pkg_metrics::{
    ACTIVE_TASKS, APPLY_ERRORS_TOTAL, APPLY_TOTAL, MetricsRegistry, STRATEGY_RELOADS_TOTAL,
};
use pkg_types::event::EventType;
use pkg_types::hpa::ScalingSpec;
use pkg_types::meta::ObjectKey;
use pkg_types::strategy::StrategySource;
use pkg_types::task::ScalingTask;

use crate::cancel::{CancelHandle, CancelToken};
use crate::error::ScalingError;
use crate::schedule::{Clock, ScheduleEntry, SharedSchedule};
use crate::store::{EventRecorder, StrategyFetcher, TargetStore, bounded};
use crate::strategy::{fingerprint, parse_strategies};

/// Collaborators and defaults shared by every task.
#[derive(Clone)]
pub struct TaskContext {
    pub targets: Arc<dyn TargetStore>,
    pub fetcher: Arc<dyn StrategyFetcher>,
    pub recorder: Arc<dyn EventRecorder>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<MetricsRegistry>,
    pub cluster_id: String,
    /// Used by tasks that do not name their own source.
    pub default_source: Option<StrategySource>,
    pub default_refresh: Duration,
    pub call_timeout: Duration,
}

/// Resolved settings of one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskConfig {
    pub key: ObjectKey,
    pub target: ObjectKey,
    pub source: StrategySource,
    pub refresh_interval: Duration,
}

impl TaskConfig {
    pub fn from_task(task: &ScalingTask, ctx: &TaskContext) -> Result<Self, ScalingError> {
        let target = task.target_key().ok_or_else(|| {
            ScalingError::Structural(format!("scaling task {} has no target", task.key()))
        })?;
        let source = task
            .spec
            .strategy_source
            .as_ref()
            .or(ctx.default_source.as_ref())
            .ok_or_else(|| {
                ScalingError::Config(format!("no strategy source for scaling task {}", task.key()))
            })?
            .render(&ctx.cluster_id, &target.namespace, &target.name);
        let refresh_interval = match task.spec.refresh_interval_minutes {
            Some(m) => Duration::from_secs(u64::from(m) * 60),
            None => ctx.default_refresh,
        };
        Ok(Self {
            key: task.key(),
            target,
            source,
            refresh_interval,
        })
    }
}

/// Result of applying a spec to the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { valid_time: String },
    /// The target already carries the window's spec.
    Unchanged { valid_time: String },
    /// Strategies unchanged since the window in force was applied; the
    /// target is left alone.
    UpToDate,
    /// The schedule has no window in force.
    NoWindow,
}

/// Apply logic of one task, independent of its loop.
pub struct TaskRunner {
    config: TaskConfig,
    ctx: TaskContext,
    schedule: SharedSchedule,
    /// Set until the window in force has been written to the target.
    pending: AtomicBool,
}

impl TaskRunner {
    pub fn new(config: TaskConfig, ctx: TaskContext) -> Self {
        Self {
            config,
            ctx,
            schedule: SharedSchedule::new(),
            pending: AtomicBool::new(false),
        }
    }

    pub fn schedule(&self) -> &SharedSchedule {
        &self.schedule
    }

    /// Fetch the strategies, rebuild the schedule if their content changed,
    /// and push the window in force to the target.
    ///
    /// With unchanged content the target is only written again when the last
    /// apply failed, so adjustments made between boundaries (policy
    /// scale-outs) hold until the next window begins.
    pub async fn apply_cycle(&self) -> Result<ApplyOutcome, ScalingError> {
        let bytes = bounded(
            "fetch strategies",
            self.ctx.call_timeout,
            self.ctx.fetcher.fetch(&self.config.source),
        )
        .await?;
        let fp = fingerprint(&bytes);
        let now = self.ctx.clock.now();

        let entry = if self.schedule.is_current(&fp).await {
            if !self.pending.load(Ordering::SeqCst) {
                debug!("Strategies of {} unchanged", self.config.key);
                return Ok(ApplyOutcome::UpToDate);
            }
            debug!("Retrying window apply of {}", self.config.key);
            self.schedule.resolve_current(now).await
        } else {
            let set = parse_strategies(&bytes)?;
            if let Some(hpa) = set.target_hpa.as_ref().filter(|h| *h != &self.config.target.name) {
                return Err(ScalingError::Config(format!(
                    "strategies from {} are for '{}', not {}",
                    self.config.source, hpa, self.config.target
                )));
            }
            let entry = self.schedule.reload(&set, fp, now).await?;
            self.ctx.metrics.counter_inc(STRATEGY_RELOADS_TOTAL);
            self.ctx
                .recorder
                .record(
                    &self.config.key,
                    EventType::Normal,
                    "StrategiesRefreshed",
                    &format!(
                        "Loaded {} strategy windows from {}",
                        set.strategies.len(),
                        self.config.source
                    ),
                )
                .await;
            entry
        };

        match entry {
            Some(entry) => self.apply_entry(&entry).await,
            None => {
                self.pending.store(false, Ordering::SeqCst);
                Ok(ApplyOutcome::NoWindow)
            }
        }
    }

    /// Apply the window of any trigger that has come due.
    pub async fn fire_due(&self) -> Result<Option<ApplyOutcome>, ScalingError> {
        let now = self.ctx.clock.now();
        match self.schedule.take_due(now).await {
            Some(entry) => {
                info!(
                    "Window '{}' of {} begins",
                    entry.valid_time, self.config.key
                );
                self.apply_entry(&entry).await.map(Some)
            }
            None => Ok(None),
        }
    }

    async fn apply_entry(&self, entry: &ScheduleEntry) -> Result<ApplyOutcome, ScalingError> {
        let valid_time = entry.valid_time.clone();
        self.pending.store(true, Ordering::SeqCst);
        let updated = self.apply_spec(&entry.spec).await?;
        self.pending.store(false, Ordering::SeqCst);
        if updated {
            info!(
                "Applied window '{}' to {}: min={} max={}",
                valid_time, self.config.target, entry.spec.min_replicas, entry.spec.max_replicas
            );
            Ok(ApplyOutcome::Applied { valid_time })
        } else {
            debug!(
                "Target {} already matches window '{}'",
                self.config.target, valid_time
            );
            Ok(ApplyOutcome::Unchanged { valid_time })
        }
    }

    /// Replace the target's spec, keeping its `scale_target_ref`. Returns
    /// whether an update was issued.
    async fn apply_spec(&self, spec: &ScalingSpec) -> Result<bool, ScalingError> {
        let current = bounded(
            "get target spec",
            self.ctx.call_timeout,
            self.ctx.targets.get_target_spec(&self.config.target),
        )
        .await?;

        let mut desired = spec.clone();
        desired.scale_target_ref = current.scale_target_ref.clone();
        if desired == current {
            return Ok(false);
        }
        bounded(
            "update target spec",
            self.ctx.call_timeout,
            self.ctx.targets.update_target_spec(&self.config.target, desired),
        )
        .await?;
        Ok(true)
    }

    /// One apply cycle with its failures logged and recorded.
    async fn cycle(&self) {
        self.ctx.metrics.counter_inc(APPLY_TOTAL);
        let result = self.apply_cycle().await;
        self.report(result).await;
    }

    async fn boundary(&self) {
        let result = match self.fire_due().await {
            Ok(None) => return,
            Ok(Some(outcome)) => Ok(outcome),
            Err(e) => Err(e),
        };
        self.ctx.metrics.counter_inc(APPLY_TOTAL);
        self.report(result).await;
    }

    async fn report(&self, result: Result<ApplyOutcome, ScalingError>) {
        match result {
            Ok(ApplyOutcome::NoWindow) => {
                debug!("No strategy window in force for {}", self.config.key);
            }
            Ok(_) => {}
            Err(e) => {
                self.ctx.metrics.counter_inc(APPLY_ERRORS_TOTAL);
                warn!("Apply cycle of {} failed: {}", self.config.key, e);
                self.ctx
                    .recorder
                    .record(
                        &self.config.key,
                        EventType::Warning,
                        "ApplyFailed",
                        &e.to_string(),
                    )
                    .await;
            }
        }
    }

    /// Sleep until the earliest schedule trigger; forever if there is none.
    async fn until_next_trigger(&self) {
        match self.schedule.next_trigger().await {
            Some(next) => {
                let wait = (next - self.ctx.clock.now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

async fn run_task(runner: Arc<TaskRunner>, mut cancel: CancelToken) {
    let refresh = runner.config.refresh_interval;
    info!(
        "Task {} started for {} (refresh={}s, source={})",
        runner.config.key,
        runner.config.target,
        refresh.as_secs(),
        runner.config.source
    );
    runner.cycle().await;

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + refresh, refresh);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => runner.cycle().await,
            _ = runner.until_next_trigger() => runner.boundary().await,
            _ = cancel.cancelled() => break,
        }
    }
    runner.schedule.stop().await;
    info!("Task {} stopped", runner.config.key);
}

/// A running task. Dropping the handle cancels the loop.
pub struct TaskHandle {
    config: TaskConfig,
    runner: Arc<TaskRunner>,
    cancel: CancelHandle,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    fn spawn(config: TaskConfig, ctx: TaskContext) -> Self {
        let runner = Arc::new(TaskRunner::new(config.clone(), ctx));
        let (cancel, token) = CancelHandle::new();
        let join = tokio::spawn(run_task(runner.clone(), token));
        Self {
            config,
            runner,
            cancel,
            join: Some(join),
        }
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn schedule(&self) -> &SharedSchedule {
        self.runner.schedule()
    }

    fn stop(mut self) -> Option<JoinHandle<()>> {
        self.cancel.cancel();
        self.join.take()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// At most one running task per scaling task key.
pub struct TaskManager {
    ctx: TaskContext,
    tasks: Mutex<HashMap<String, TaskHandle>>,
    /// Set by [`TaskManager::stop_all`]; later starts are ignored.
    closed: AtomicBool,
}

impl TaskManager {
    pub fn new(ctx: TaskContext) -> Self {
        Self {
            ctx,
            tasks: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskHandle>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a task, replacing any task already running under the same key.
    ///
    /// A task whose resolved settings are unchanged keeps running.
    pub fn start(&self, task: &ScalingTask) -> Result<(), ScalingError> {
        let config = TaskConfig::from_task(task, &self.ctx)?;
        let key = config.key.to_string();
        let mut tasks = self.tasks();
        if self.closed.load(Ordering::SeqCst) {
            debug!("Not starting task {} after shutdown", key);
            return Ok(());
        }
        if tasks.get(&key).is_some_and(|existing| existing.config() == &config) {
            debug!("Task {} already running with the same settings", key);
            return Ok(());
        }
        if let Some(old) = tasks.remove(&key) {
            info!("Replacing task {}", key);
            old.stop();
        }
        tasks.insert(key, TaskHandle::spawn(config, self.ctx.clone()));
        self.ctx.metrics.gauge_set(ACTIVE_TASKS, tasks.len() as i64);
        Ok(())
    }

    /// Cancel the task under `key`. Returns whether one was running.
    pub fn stop(&self, key: &str) -> bool {
        let mut tasks = self.tasks();
        let stopped = match tasks.remove(key) {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        };
        self.ctx.metrics.gauge_set(ACTIVE_TASKS, tasks.len() as i64);
        stopped
    }

    /// Cancel every task and wait up to `grace` for their loops to exit.
    /// Tasks started afterwards are refused.
    pub async fn stop_all(&self, grace: Duration) {
        let joins: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks();
            self.closed.store(true, Ordering::SeqCst);
            let joins = tasks.drain().filter_map(|(_, h)| h.stop()).collect();
            self.ctx.metrics.gauge_set(ACTIVE_TASKS, 0);
            joins
        };
        if joins.is_empty() {
            return;
        }
        let count = joins.len();
        let wait = async {
            for join in joins {
                let _ = join.await;
            }
        };
        if tokio::time::timeout(grace, wait).await.is_err() {
            warn!("{} tasks did not stop within {:?}", count, grace);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.tasks().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn schedule(&self, key: &str) -> Option<SharedSchedule> {
        self.tasks().get(key).map(|h| h.schedule().clone())
    }
}
