use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

/// Type of event in the watch stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

/// A single watch event representing a state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub seq: u64,
    pub event_type: EventType,
    pub key: String,
    #[serde(default)]
    pub value: Option<Vec<u8>>,
}

/// In-process fan-out of state mutations, numbered in emit order.
/// Clients subscribe and filter by key prefix.
#[derive(Clone)]
pub struct EventLog {
    seq: Arc<Mutex<u64>>,
    sender: broadcast::Sender<WatchEvent>,
}

impl EventLog {
    /// `capacity` bounds how far a subscriber may fall behind before it
    /// starts missing events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            seq: Arc::new(Mutex::new(0)),
            sender,
        }
    }

    /// Record a new event. Called internally by StateStore on put/delete.
    pub async fn emit(&self, event_type: EventType, key: String, value: Option<Vec<u8>>) {
        let mut seq = self.seq.lock().await;
        *seq += 1;
        let event = WatchEvent {
            seq: *seq,
            event_type,
            key,
            value,
        };
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive new events as they are emitted.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.sender.subscribe()
    }

    /// Live events whose key starts with `prefix`.
    ///
    /// Events dropped because the subscriber lagged are skipped; watchers are
    /// expected to relist periodically to catch up.
    pub fn watch_prefix(&self, prefix: &str) -> impl Stream<Item = WatchEvent> + Send + 'static {
        let prefix = prefix.to_string();
        BroadcastStream::new(self.subscribe()).filter_map(move |result| match result {
            Ok(event) if event.key.starts_with(&prefix) => Some(event),
            _ => None,
        })
    }
}
