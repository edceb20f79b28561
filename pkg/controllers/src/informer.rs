use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use pkg_constants::state::SCALING_TASK_PREFIX;
use pkg_state::watch::{EventLog, EventType, WatchEvent};
use pkg_types::meta::ObjectKey;
use pkg_types::task::ScalingTask;

use crate::cancel::CancelToken;
use crate::registry::key_from_path;
use crate::store::TaskLister;

/// Change notification for a scaling task.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Added(ScalingTask),
    /// Also emitted by every resync with an unchanged version.
    Updated { old_version: u64, task: ScalingTask },
    Deleted(ObjectKey),
}

impl TaskEvent {
    pub fn key(&self) -> ObjectKey {
        match self {
            TaskEvent::Added(task) | TaskEvent::Updated { task, .. } => task.key(),
            TaskEvent::Deleted(key) => key.clone(),
        }
    }
}

/// Turns the state store's watch stream into [`TaskEvent`]s.
///
/// Starts with a full list, follows live changes, and relists on every resync
/// to catch up with changes the live stream dropped.
pub struct TaskInformer {
    lister: Arc<dyn TaskLister>,
    events: EventLog,
    resync: Duration,
    known: HashMap<ObjectKey, u64>,
}

impl TaskInformer {
    pub fn new(lister: Arc<dyn TaskLister>, events: EventLog, resync: Duration) -> Self {
        Self {
            lister,
            events,
            resync,
            known: HashMap::new(),
        }
    }

    pub fn spawn(
        self,
        tx: mpsc::Sender<TaskEvent>,
        cancel: CancelToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(tx, cancel))
    }

    /// Run until cancelled or until the receiver is dropped.
    pub async fn run(mut self, tx: mpsc::Sender<TaskEvent>, mut cancel: CancelToken) {
        let stream = self.events.watch_prefix(SCALING_TASK_PREFIX);
        tokio::pin!(stream);

        if !self.relist(&tx).await {
            return;
        }
        info!(
            "Task informer synced {} tasks (resync={}s)",
            self.known.len(),
            self.resync.as_secs()
        );

        let mut resync =
            tokio::time::interval_at(tokio::time::Instant::now() + self.resync, self.resync);
        loop {
            let open = tokio::select! {
                Some(event) = stream.next() => self.on_watch(event, &tx).await,
                _ = resync.tick() => self.relist(&tx).await,
                _ = cancel.cancelled() => break,
            };
            if !open {
                debug!("Task event receiver closed");
                break;
            }
        }
        info!("Task informer stopped");
    }

    /// Returns false once the receiver is gone.
    async fn relist(&mut self, tx: &mpsc::Sender<TaskEvent>) -> bool {
        let tasks = match self.lister.list_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("Failed to list scaling tasks: {}", e);
                return true;
            }
        };

        let listed: Vec<ObjectKey> = tasks.iter().map(ScalingTask::key).collect();
        let gone: Vec<ObjectKey> = self
            .known
            .keys()
            .filter(|k| !listed.contains(k))
            .cloned()
            .collect();

        for task in tasks {
            if !self.observe(task, tx).await {
                return false;
            }
        }
        for key in gone {
            self.known.remove(&key);
            if tx.send(TaskEvent::Deleted(key)).await.is_err() {
                return false;
            }
        }
        true
    }

    async fn on_watch(&mut self, event: WatchEvent, tx: &mpsc::Sender<TaskEvent>) -> bool {
        let Some(key) = key_from_path(SCALING_TASK_PREFIX, &event.key) else {
            debug!("Ignoring watch event for {}", event.key);
            return true;
        };
        match event.event_type {
            EventType::Put => {
                let decoded = event
                    .value
                    .as_deref()
                    .and_then(|v| serde_json::from_slice::<ScalingTask>(v).ok());
                let task = match decoded {
                    Some(task) => Some(task),
                    None => match self.lister.get_task(&key).await {
                        Ok(task) => task,
                        Err(e) => {
                            warn!("Failed to read scaling task {}: {}", key, e);
                            None
                        }
                    },
                };
                match task {
                    Some(task) => self.observe(task, tx).await,
                    None => true,
                }
            }
            EventType::Delete => {
                if self.known.remove(&key).is_none() {
                    return true;
                }
                tx.send(TaskEvent::Deleted(key)).await.is_ok()
            }
        }
    }

    async fn observe(&mut self, task: ScalingTask, tx: &mpsc::Sender<TaskEvent>) -> bool {
        let event = match self.known.insert(task.key(), task.resource_version) {
            None => TaskEvent::Added(task),
            Some(old_version) => TaskEvent::Updated { old_version, task },
        };
        tx.send(event).await.is_ok()
    }
}
