use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use pkg_constants::controller::{QUEUE_BASE_DELAY_MS, QUEUE_MAX_DELAY_SECS};

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Keys waiting to be processed, queued or not.
    dirty: HashSet<String>,
    /// Keys handed out by `get` and not yet marked `done`.
    processing: HashSet<String>,
    shutting_down: bool,
}

/// Rate-limited, deduplicating work queue of reconciliation keys.
///
/// A key sits in the queue at most once. A key added while it is being
/// processed is parked until `done`, so no two workers ever hold the same key.
/// Failed keys come back through [`WorkQueue::add_rate_limited`] with a
/// per-key exponential backoff that only resets on [`WorkQueue::forget`].
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    failures: Mutex<HashMap<String, u32>>,
    base_delay: Duration,
    max_delay: Duration,
}

impl WorkQueue {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            failures: Mutex::new(HashMap::new()),
            base_delay,
            max_delay,
        }
    }

    /// 5ms doubling up to 1000s.
    pub fn with_default_backoff() -> Self {
        Self::new(
            Duration::from_millis(QUEUE_BASE_DELAY_MS),
            Duration::from_secs(QUEUE_MAX_DELAY_SECS),
        )
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, key: &str) {
        let mut state = self.state();
        if state.shutting_down || !state.dirty.insert(key.to_string()) {
            return;
        }
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release a key handed out by `get`, requeueing it if it was added again
    /// in the meantime.
    pub fn done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Reset the backoff of a key.
    pub fn forget(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Delay before the next retry of `key`, counting this failure.
    fn when(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(key.to_string()).or_insert(0);
        let delay = backoff(self.base_delay, self.max_delay, *count);
        *count = count.saturating_add(1);
        delay
    }

    /// Re-add `key` after its backoff delay. Returns the delay used.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) -> Duration {
        let delay = self.when(key);
        debug!("Requeueing {} in {:?}", key, delay);
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
        delay
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting keys and release every waiting `get`.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}

fn backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(failures)).min(max)
}
