use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pkg_constants::controller::CONTROLLER_AGENT_NAME;
use pkg_metrics::{
    MetricsRegistry, RECONCILE_DROPPED_TOTAL, RECONCILE_ERRORS_TOTAL, RECONCILE_TOTAL,
};
use pkg_types::event::EventType;
use pkg_types::meta::ObjectKey;
use pkg_types::policy::PolicySpec;
use pkg_types::validate::validate_scaling_task;

use crate::cancel::CancelToken;
use crate::error::ScalingError;
use crate::informer::TaskEvent;
use crate::policy::PolicyManager;
use crate::queue::WorkQueue;
use crate::store::{TaskLister, bounded};
use crate::task::TaskManager;

/// Owner name of policies declared in the controller config.
pub const CONFIG_POLICY_OWNER: &str = "controller-config";

pub struct ControllerSettings {
    pub workers: usize,
    /// Namespace of bare keys and of config policies without one
    pub namespace: String,
    pub shutdown_grace: Duration,
    pub call_timeout: Duration,
    pub policies: Vec<PolicySpec>,
}

/// Reconciles scaling tasks into running tasks and policies.
///
/// Watch events feed a [`WorkQueue`]; workers pull keys from it and start,
/// replace or stop the task of each key.
pub struct Controller {
    queue: Arc<WorkQueue>,
    lister: Arc<dyn TaskLister>,
    tasks: Arc<TaskManager>,
    policies: Arc<PolicyManager>,
    metrics: Arc<MetricsRegistry>,
    settings: ControllerSettings,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    pub fn new(
        lister: Arc<dyn TaskLister>,
        tasks: Arc<TaskManager>,
        policies: Arc<PolicyManager>,
        metrics: Arc<MetricsRegistry>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            queue: Arc::new(WorkQueue::with_default_backoff()),
            lister,
            tasks,
            policies,
            metrics,
            settings,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn policies(&self) -> &PolicyManager {
        &self.policies
    }

    /// Start the workers and config policies, then dispatch events until
    /// `shutdown` fires or the event stream ends. Stops everything on return.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<TaskEvent>,
        mut shutdown: CancelToken,
    ) -> anyhow::Result<()> {
        info!(
            "Starting {} with {} workers",
            CONTROLLER_AGENT_NAME, self.settings.workers
        );
        self.policies
            .sync(
                CONFIG_POLICY_OWNER,
                &self.settings.namespace,
                None,
                &self.settings.policies,
            )
            .await;

        {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            for id in 0..self.settings.workers.max(1) {
                let controller = self.clone();
                workers.push(tokio::spawn(async move {
                    debug!("Worker {} started", id);
                    while controller.process_next_work_item().await {}
                    debug!("Worker {} stopped", id);
                }));
            }
        }

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        info!("Task event stream closed");
                        break;
                    }
                },
                _ = shutdown.cancelled() => break,
            }
        }

        self.shutdown(self.settings.shutdown_grace).await;
        Ok(())
    }

    /// Stop accepting work, let the workers finish their current key, then
    /// cancel every task and policy. Each wait is bounded by `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        info!("Shutting down {}", CONTROLLER_AGENT_NAME);
        self.queue.shut_down();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        if !join_within(workers, grace).await {
            warn!("Workers still running after {:?}", grace);
        }

        self.tasks.stop_all(grace).await;
        let policies = self.policies.stop_all().await;
        if !join_within(policies, grace).await {
            warn!("Policies still running after {:?}", grace);
        }
    }

    pub async fn handle_event(&self, event: TaskEvent) {
        match event {
            TaskEvent::Added(task) => {
                debug!("Scaling task {} added", task.key());
                self.queue.add(&task.key().to_string());
            }
            TaskEvent::Updated { old_version, task } => {
                if old_version == task.resource_version {
                    return;
                }
                debug!(
                    "Scaling task {} updated ({} -> {})",
                    task.key(),
                    old_version,
                    task.resource_version
                );
                self.queue.add(&task.key().to_string());
            }
            TaskEvent::Deleted(key) => {
                info!("Scaling task {} deleted", key);
                self.stop_key(&key).await;
                // A worker may be mid-sync on this key; the follow-up sync
                // finds the object gone and stops whatever it started.
                self.queue.add(&key.to_string());
            }
        }
    }

    async fn stop_key(&self, key: &ObjectKey) {
        let key = key.to_string();
        self.tasks.stop(&key);
        self.policies.remove_owner(&key).await;
    }

    /// Handle one key from the queue. Returns false once the queue is shut down.
    async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        self.metrics.counter_inc(RECONCILE_TOTAL);

        match self.sync_handler(&key).await {
            Ok(()) => self.queue.forget(&key),
            Err(e) if e.is_retryable() => {
                self.metrics.counter_inc(RECONCILE_ERRORS_TOTAL);
                let delay = self.queue.add_rate_limited(&key);
                warn!("Error syncing '{}', requeueing in {:?}: {}", key, delay, e);
            }
            Err(e) => {
                self.metrics.counter_inc(RECONCILE_DROPPED_TOTAL);
                error!("Dropping '{}' from the queue: {}", key, e);
                self.queue.forget(&key);
            }
        }
        self.queue.done(&key);
        true
    }

    /// Bring the running task of `key` in line with the stored scaling task.
    async fn sync_handler(&self, key: &str) -> Result<(), ScalingError> {
        let object = ObjectKey::parse(key, &self.settings.namespace)
            .map_err(|e| ScalingError::InvalidKey(format!("{}: {}", key, e)))?;
        let timeout = self.settings.call_timeout;

        let task = match bounded("get scaling task", timeout, self.lister.get_task(&object)).await? {
            Some(task) => task,
            None => {
                info!("Scaling task '{}' no longer exists", object);
                self.stop_key(&object).await;
                return Ok(());
            }
        };
        validate_scaling_task(&task).map_err(|e| ScalingError::Structural(e.to_string()))?;
        let target = task
            .target_key()
            .ok_or_else(|| ScalingError::Structural(format!("scaling task {} has no target", object)))?;

        let ctx = self.tasks.context();
        let known = bounded(
            "list scaling targets",
            timeout,
            ctx.targets.list_targets(&target.namespace),
        )
        .await?;
        if !known.contains(&target) {
            return Err(ScalingError::Transient(anyhow::anyhow!(
                "scaling target {} of task {} not found",
                target,
                object
            )));
        }

        self.tasks.start(&task)?;
        self.policies
            .sync(
                &object.to_string(),
                &task.namespace,
                Some(&target),
                &task.spec.policies,
            )
            .await;
        ctx.recorder
            .record(
                &object,
                EventType::Normal,
                "Synced",
                "Scaling task synced successfully",
            )
            .await;
        Ok(())
    }
}

/// Await `handles`, giving up after `grace`. Returns whether all finished.
async fn join_within(handles: Vec<JoinHandle<()>>, grace: Duration) -> bool {
    let wait = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    tokio::time::timeout(grace, wait).await.is_ok()
}
