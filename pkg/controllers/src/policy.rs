use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pkg_metrics::{
    ACTIVE_POLICIES, MetricsRegistry, POLICY_ACTION_ERRORS_TOTAL, POLICY_ACTIONS_TOTAL,
    POLICY_EVALUATIONS_TOTAL,
};
use pkg_types::meta::ObjectKey;
use pkg_types::policy::PolicySpec;
use pkg_types::validate::validate_policy;

use crate::action::{ActionExecutor, ScalingAction};
use crate::cancel::{CancelHandle, CancelToken};
use crate::error::ScalingError;
use crate::store::{MetricSource, bounded};

/// Collaborators and timing shared by every policy loop.
#[derive(Clone)]
pub struct PolicyContext {
    pub source: Arc<dyn MetricSource>,
    pub executor: Arc<ActionExecutor>,
    pub metrics: Arc<MetricsRegistry>,
    pub interval: Duration,
    pub max_sample_age: Duration,
    pub call_timeout: Duration,
}

/// Outcome of the evaluate step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Evaluation {
    Satisfied(f64),
    Unsatisfied(f64),
    /// No sample, or only one older than the allowed age.
    NoData,
}

/// Hysteresis state of one policy.
///
/// `satisfied_count` counts consecutive satisfied evaluations. It is reset by
/// any unsatisfied evaluation, by a missing sample, by a successful action and
/// by an action that can never succeed.
pub struct MetricEvaluation {
    spec: PolicySpec,
    target: ObjectKey,
    satisfied_count: u32,
}

impl MetricEvaluation {
    pub fn new(spec: PolicySpec, target: ObjectKey) -> Self {
        Self {
            spec,
            target,
            satisfied_count: 0,
        }
    }

    pub fn satisfied_count(&self) -> u32 {
        self.satisfied_count
    }

    /// Fetch the latest sample and fold it into the count.
    ///
    /// A source error leaves the count untouched and is returned to the caller.
    pub async fn evaluate(
        &mut self,
        source: &dyn MetricSource,
        max_sample_age: Duration,
        call_timeout: Duration,
    ) -> Result<Evaluation, ScalingError> {
        let sample = bounded(
            "fetch metric sample",
            call_timeout,
            source.latest_sample(&self.spec.metric_name, &self.spec.dimensions),
        )
        .await?;

        let max_age = chrono::Duration::from_std(max_sample_age).unwrap_or(chrono::Duration::MAX);
        let evaluation = match sample {
            Some(s) if Utc::now() - s.timestamp <= max_age => {
                if self
                    .spec
                    .comparison_operator
                    .is_satisfied(s.value, self.spec.threshold)
                {
                    Evaluation::Satisfied(s.value)
                } else {
                    Evaluation::Unsatisfied(s.value)
                }
            }
            Some(s) => {
                debug!(
                    "Policy {}: sample of {} from {} is too old",
                    self.spec.name, self.spec.metric_name, s.timestamp
                );
                Evaluation::NoData
            }
            None => Evaluation::NoData,
        };

        match evaluation {
            Evaluation::Satisfied(_) => self.satisfied_count = self.satisfied_count.saturating_add(1),
            _ => self.satisfied_count = 0,
        }
        debug!(
            "Policy {}: {} {} {} -> {:?} (count {}/{})",
            self.spec.name,
            self.spec.metric_name,
            self.spec.comparison_operator,
            self.spec.threshold,
            evaluation,
            self.satisfied_count,
            self.spec.evaluation_periods
        );
        Ok(evaluation)
    }

    /// Invoke the executor once enough consecutive evaluations were satisfied.
    ///
    /// Returns `None` when the threshold has not been reached yet.
    pub async fn act(
        &mut self,
        executor: &ActionExecutor,
    ) -> Option<Result<ScalingAction, ScalingError>> {
        if self.satisfied_count < self.spec.evaluation_periods {
            return None;
        }
        info!(
            "Policy {} triggered after {} periods: {} on {}",
            self.spec.name, self.satisfied_count, self.spec.adjustment, self.target
        );
        let result = executor.execute(&self.target, self.spec.adjustment).await;
        match &result {
            Ok(_) => self.satisfied_count = 0,
            Err(e) if e.is_not_implemented() => {
                error!("Policy {} cannot act: {}", self.spec.name, e);
                self.satisfied_count = 0;
            }
            Err(e) => {
                warn!(
                    "Policy {} action failed, retrying while the metric stays satisfied: {}",
                    self.spec.name, e
                );
            }
        }
        Some(result)
    }

    /// One evaluate-then-act cycle.
    pub async fn tick(&mut self, ctx: &PolicyContext) {
        ctx.metrics.counter_inc(POLICY_EVALUATIONS_TOTAL);
        if let Err(e) = self
            .evaluate(ctx.source.as_ref(), ctx.max_sample_age, ctx.call_timeout)
            .await
        {
            warn!("Policy {}: evaluation skipped: {}", self.spec.name, e);
            return;
        }
        match self.act(&ctx.executor).await {
            Some(Ok(_)) => ctx.metrics.counter_inc(POLICY_ACTIONS_TOTAL),
            Some(Err(_)) => ctx.metrics.counter_inc(POLICY_ACTION_ERRORS_TOTAL),
            None => {}
        }
    }
}

/// A metric policy and its evaluation loop.
pub struct Policy {
    spec: PolicySpec,
    target: ObjectKey,
    ctx: PolicyContext,
    running: Option<(CancelHandle, JoinHandle<()>)>,
}

impl Policy {
    pub fn new(spec: PolicySpec, target: ObjectKey, ctx: PolicyContext) -> Self {
        Self {
            spec,
            target,
            ctx,
            running: None,
        }
    }

    pub fn spec(&self) -> &PolicySpec {
        &self.spec
    }

    pub fn target(&self) -> &ObjectKey {
        &self.target
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Spawn the evaluation loop. No-op if already running.
    pub fn start(&mut self) {
        if self.running.is_some() {
            return;
        }
        let (cancel, token) = CancelHandle::new();
        let evaluation = MetricEvaluation::new(self.spec.clone(), self.target.clone());
        let handle = tokio::spawn(run_policy(evaluation, self.ctx.clone(), token));
        info!(
            "Policy {} started on {} (interval={}s)",
            self.spec.name,
            self.target,
            self.ctx.interval.as_secs()
        );
        self.running = Some((cancel, handle));
    }

    /// Signal the loop to exit. It leaves at its next wait point; await the
    /// returned handle to observe that.
    pub fn stop(&mut self) -> Option<JoinHandle<()>> {
        let (cancel, handle) = self.running.take()?;
        cancel.cancel();
        info!("Policy {} stopped", self.spec.name);
        Some(handle)
    }

    /// Replace the definition: stop, wait for the old loop, swap, start.
    pub async fn update(&mut self, spec: PolicySpec, target: ObjectKey) {
        if let Some(handle) = self.stop() {
            let _ = handle.await;
        }
        self.spec = spec;
        self.target = target;
        self.start();
    }
}

impl Drop for Policy {
    fn drop(&mut self) {
        if let Some((cancel, _)) = &self.running {
            cancel.cancel();
        }
    }
}

async fn run_policy(mut evaluation: MetricEvaluation, ctx: PolicyContext, mut cancel: CancelToken) {
    let start = tokio::time::Instant::now() + ctx.interval;
    let mut interval = tokio::time::interval_at(start, ctx.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => evaluation.tick(&ctx).await,
            _ = cancel.cancelled() => break,
        }
    }
    debug!("Policy {} loop exited", evaluation.spec.name);
}

/// Running policies keyed by owner and policy name.
///
/// The owner is the key of the scaling task that declared the policies, or a
/// fixed name for policies from the controller config.
pub struct PolicyManager {
    ctx: PolicyContext,
    policies: Mutex<HashMap<(String, String), Policy>>,
    /// Set by [`PolicyManager::stop_all`]; later syncs start nothing.
    closed: AtomicBool,
}

impl PolicyManager {
    pub fn new(ctx: PolicyContext) -> Self {
        Self {
            ctx,
            policies: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Make the running policies of `owner` match `specs`.
    ///
    /// Unchanged policies keep their loop and count, changed ones are updated,
    /// missing ones are stopped. Policies that fail validation or have no
    /// resolvable target are skipped with a warning.
    pub async fn sync(
        &self,
        owner: &str,
        default_namespace: &str,
        default_target: Option<&ObjectKey>,
        specs: &[PolicySpec],
    ) {
        let mut policies = self.policies.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            debug!("Ignoring policy sync of {} after shutdown", owner);
            return;
        }
        let mut wanted = Vec::with_capacity(specs.len());

        for spec in specs {
            if let Err(e) = validate_policy(spec) {
                warn!("Skipping policy '{}' of {}: {}", spec.name, owner, e);
                continue;
            }
            let target = match resolve_target(spec, default_namespace, default_target) {
                Ok(t) => t,
                Err(e) => {
                    warn!("Skipping policy '{}' of {}: {}", spec.name, owner, e);
                    continue;
                }
            };
            let key = (owner.to_string(), spec.name.clone());
            wanted.push(key.clone());

            match policies.get_mut(&key) {
                Some(existing) if existing.spec() == spec && existing.target() == &target => {}
                Some(existing) => existing.update(spec.clone(), target).await,
                None => {
                    let mut policy = Policy::new(spec.clone(), target, self.ctx.clone());
                    policy.start();
                    policies.insert(key, policy);
                }
            }
        }

        let stale: Vec<(String, String)> = policies
            .keys()
            .filter(|k| k.0 == owner && !wanted.contains(k))
            .cloned()
            .collect();
        for key in stale {
            if let Some(mut policy) = policies.remove(&key) {
                policy.stop();
            }
        }
        self.ctx.metrics.gauge_set(ACTIVE_POLICIES, policies.len() as i64);
    }

    /// Stop every policy declared by `owner`.
    pub async fn remove_owner(&self, owner: &str) {
        let mut policies = self.policies.lock().await;
        policies.retain(|(o, _), policy| {
            if o == owner {
                policy.stop();
                false
            } else {
                true
            }
        });
        self.ctx.metrics.gauge_set(ACTIVE_POLICIES, policies.len() as i64);
    }

    /// Stop everything and hand back the loops to wait on.
    pub async fn stop_all(&self) -> Vec<JoinHandle<()>> {
        let mut policies = self.policies.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        let handles = policies.values_mut().filter_map(Policy::stop).collect();
        policies.clear();
        self.ctx.metrics.gauge_set(ACTIVE_POLICIES, 0);
        handles
    }

    pub async fn len(&self) -> usize {
        self.policies.lock().await.len()
    }

    pub async fn contains(&self, owner: &str, name: &str) -> bool {
        self.policies
            .lock()
            .await
            .contains_key(&(owner.to_string(), name.to_string()))
    }
}

fn resolve_target(
    spec: &PolicySpec,
    default_namespace: &str,
    default_target: Option<&ObjectKey>,
) -> anyhow::Result<ObjectKey> {
    match (&spec.target, default_target) {
        (Some(target), _) => ObjectKey::parse(target, default_namespace),
        (None, Some(target)) => Ok(target.clone()),
        (None, None) => anyhow::bail!("no target"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeMetrics, FakeTargetStore, Reading};
    use pkg_types::policy::{ComparisonOperator, ScalingAdjustment};

    fn policy_spec(adjustment: ScalingAdjustment) -> PolicySpec {
        PolicySpec {
            name: "cpu-high".to_string(),
            target: None,
            metric_name: "cpu_utilization".to_string(),
            dimensions: Vec::new(),
            comparison_operator: ComparisonOperator::GreaterThanThreshold,
            threshold: 50.0,
            evaluation_periods: 2,
            adjustment,
        }
    }

    fn target() -> ObjectKey {
        ObjectKey::new("default", "web")
    }

    fn context(source: Arc<FakeMetrics>, store: Arc<FakeTargetStore>, interval: Duration) -> PolicyContext {
        PolicyContext {
            source,
            executor: Arc::new(ActionExecutor::new(store, Duration::from_secs(1))),
            metrics: Arc::new(MetricsRegistry::for_controller()),
            interval,
            max_sample_age: Duration::from_secs(180),
            call_timeout: Duration::from_secs(1),
        }
    }

    /// Drive `ticks` evaluate-then-act cycles and return how many times the
    /// executor mutated the target.
    async fn run_ticks(readings: Vec<Reading>, adjustment: ScalingAdjustment) -> (usize, MetricEvaluation, Arc<FakeTargetStore>) {
        let ticks = readings.len();
        let source = Arc::new(FakeMetrics::new(readings));
        let store = Arc::new(FakeTargetStore::with_target("default", "web", 2, 20));
        let ctx = context(source, store.clone(), Duration::from_secs(60));
        let mut evaluation = MetricEvaluation::new(policy_spec(adjustment), target());
        for _ in 0..ticks {
            evaluation.tick(&ctx).await;
        }
        (store.update_count(), evaluation, store)
    }

    #[tokio::test]
    async fn fires_after_consecutive_satisfied_periods() {
        let (updates, evaluation, store) = run_ticks(
            vec![Reading::Value(60.0), Reading::Value(70.0)],
            ScalingAdjustment::ChangeInCapacity(1),
        )
        .await;
        assert_eq!(updates, 1);
        assert_eq!(evaluation.satisfied_count(), 0);
        assert_eq!(store.spec(&target()).min_replicas, 3);
    }

    #[tokio::test]
    async fn unsatisfied_evaluation_resets_the_count() {
        let source = Arc::new(FakeMetrics::values(&[60.0, 40.0, 60.0, 70.0]));
        let store = Arc::new(FakeTargetStore::with_target("default", "web", 2, 20));
        let ctx = context(source, store.clone(), Duration::from_secs(60));
        let mut evaluation =
            MetricEvaluation::new(policy_spec(ScalingAdjustment::ChangeInCapacity(1)), target());

        let mut counts = Vec::new();
        let mut updates = Vec::new();
        for _ in 0..4 {
            evaluation.tick(&ctx).await;
            counts.push(evaluation.satisfied_count());
            updates.push(store.update_count());
        }
        assert_eq!(counts, vec![1, 0, 1, 0]);
        assert_eq!(updates, vec![0, 0, 0, 1]);
    }

    #[tokio::test]
    async fn missing_or_stale_samples_reset_the_count() {
        let (updates, evaluation, _) = run_ticks(
            vec![
                Reading::Value(60.0),
                Reading::Missing,
                Reading::Value(60.0),
                Reading::Stale(90.0),
                Reading::Value(60.0),
            ],
            ScalingAdjustment::ChangeInCapacity(1),
        )
        .await;
        assert_eq!(updates, 0);
        assert_eq!(evaluation.satisfied_count(), 1);
    }

    #[tokio::test]
    async fn source_errors_keep_the_count_and_skip_acting() {
        let (updates, evaluation, _) = run_ticks(
            vec![Reading::Value(60.0), Reading::Error, Reading::Error],
            ScalingAdjustment::ChangeInCapacity(1),
        )
        .await;
        assert_eq!(updates, 0);
        assert_eq!(evaluation.satisfied_count(), 1);
    }

    #[tokio::test]
    async fn failed_action_retries_while_satisfied() {
        let source = Arc::new(FakeMetrics::values(&[60.0, 70.0, 80.0]));
        let store = Arc::new(FakeTargetStore::with_target("default", "web", 2, 20));
        store.fail_updates(1);
        let ctx = context(source, store.clone(), Duration::from_secs(60));
        let mut evaluation =
            MetricEvaluation::new(policy_spec(ScalingAdjustment::ChangeInCapacity(1)), target());

        evaluation.tick(&ctx).await;
        evaluation.tick(&ctx).await;
        assert_eq!(store.update_count(), 0);
        assert_eq!(evaluation.satisfied_count(), 2);

        evaluation.tick(&ctx).await;
        assert_eq!(store.update_count(), 1);
        assert_eq!(evaluation.satisfied_count(), 0);
        assert_eq!(ctx.metrics.counter_get(POLICY_ACTION_ERRORS_TOTAL), 1);
        assert_eq!(ctx.metrics.counter_get(POLICY_ACTIONS_TOTAL), 1);
    }

    #[tokio::test]
    async fn failed_action_is_dropped_once_unsatisfied() {
        let source = Arc::new(FakeMetrics::values(&[60.0, 70.0, 10.0, 60.0]));
        let store = Arc::new(FakeTargetStore::with_target("default", "web", 2, 20));
        store.fail_updates(1);
        let ctx = context(source, store.clone(), Duration::from_secs(60));
        let mut evaluation =
            MetricEvaluation::new(policy_spec(ScalingAdjustment::ChangeInCapacity(1)), target());

        for _ in 0..4 {
            evaluation.tick(&ctx).await;
        }
        assert_eq!(store.update_count(), 0);
        assert_eq!(evaluation.satisfied_count(), 1);
    }

    #[tokio::test]
    async fn not_implemented_action_resets_and_continues() {
        let (updates, evaluation, store) = run_ticks(
            vec![
                Reading::Value(60.0),
                Reading::Value(70.0),
                Reading::Value(80.0),
            ],
            ScalingAdjustment::ChangeInCapacity(-3),
        )
        .await;
        assert_eq!(updates, 0);
        assert_eq!(evaluation.satisfied_count(), 1);
        assert_eq!(store.spec(&target()).min_replicas, 2);
    }

    #[tokio::test]
    async fn policy_loop_runs_until_stopped() {
        let source = Arc::new(FakeMetrics::values(&[60.0; 64]));
        let store = Arc::new(FakeTargetStore::with_target("default", "web", 2, 1000));
        let ctx = context(source.clone(), store.clone(), Duration::from_millis(10));

        let mut policy = Policy::new(
            policy_spec(ScalingAdjustment::ChangeInCapacity(1)),
            target(),
            ctx,
        );
        policy.start();
        policy.start();
        assert!(policy.is_running());

        tokio::time::sleep(Duration::from_millis(120)).await;
        let handle = policy.stop().unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!policy.is_running());

        let calls = source.calls();
        assert!(calls >= 2);
        assert!(store.update_count() >= 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.calls(), calls);
    }

    #[tokio::test]
    async fn manager_syncs_by_owner() {
        let source = Arc::new(FakeMetrics::default());
        let store = Arc::new(FakeTargetStore::with_target("default", "web", 2, 20));
        let manager = PolicyManager::new(context(source, store, Duration::from_secs(60)));
        let owner_target = target();

        let mut low = policy_spec(ScalingAdjustment::ChangeInCapacity(1));
        low.name = "cpu-low".to_string();
        low.comparison_operator = ComparisonOperator::LessThanThreshold;
        let high = policy_spec(ScalingAdjustment::ChangeInCapacity(2));
        let mut invalid = policy_spec(ScalingAdjustment::ChangeInCapacity(1));
        invalid.name = "broken".to_string();
        invalid.evaluation_periods = 0;

        manager
            .sync("default/task-a", "default", Some(&owner_target), &[high.clone(), low.clone(), invalid])
            .await;
        manager
            .sync("config", "default", None, &[high.clone()])
            .await;
        assert_eq!(manager.len().await, 2);
        assert!(manager.contains("default/task-a", "cpu-high").await);
        assert!(manager.contains("default/task-a", "cpu-low").await);
        assert!(!manager.contains("default/task-a", "broken").await);
        assert!(!manager.contains("config", "cpu-high").await);

        manager.sync("default/task-a", "default", Some(&owner_target), &[low]).await;
        assert!(!manager.contains("default/task-a", "cpu-high").await);
        assert_eq!(manager.len().await, 1);

        manager.remove_owner("default/task-a").await;
        assert_eq!(manager.len().await, 0);
        assert!(manager.stop_all().await.is_empty());
    }

    #[tokio::test]
    async fn sync_after_stop_all_starts_nothing() {
        let source = Arc::new(FakeMetrics::default());
        let store = Arc::new(FakeTargetStore::with_target("default", "web", 2, 20));
        let manager = PolicyManager::new(context(source, store, Duration::from_secs(60)));
        let high = policy_spec(ScalingAdjustment::ChangeInCapacity(2));

        manager.sync("default/task-a", "default", Some(&target()), &[high.clone()]).await;
        assert_eq!(manager.stop_all().await.len(), 1);

        manager.sync("default/task-a", "default", Some(&target()), &[high]).await;
        assert_eq!(manager.len().await, 0);
    }
}
