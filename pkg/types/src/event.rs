use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => write!(f, "Normal"),
            EventType::Warning => write!(f, "Warning"),
        }
    }
}

/// A recorded occurrence attached to an object, e.g. a failed apply cycle.
///
/// Repeats of the same reason and message on one object are folded into a
/// single event: `count` goes up and `timestamp` moves to the latest one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub namespace: String,
    /// `namespace/name` of the object the event is about
    pub involved_object: String,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub source: String,
    #[serde(default = "one")]
    pub count: u32,
    pub first_timestamp: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

fn one() -> u32 {
    1
}

impl Event {
    /// Whether `self` is a repeat of `other`.
    pub fn repeats(&self, other: &Event) -> bool {
        self.involved_object == other.involved_object
            && self.event_type == other.event_type
            && self.reason == other.reason
            && self.message == other.message
    }
}
