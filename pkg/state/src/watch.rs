use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Type of event in the watch stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

/// A single watch event representing a state change.
///
/// `prior` carries the pre-write value (when one existed) so consumers can
/// detect update transitions, e.g. a pod entering a terminal phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub seq: u64,
    pub event_type: EventType,
    pub key: String,
    #[serde(default)]
    pub value: Option<Vec<u8>>,
    #[serde(default)]
    pub prior: Option<Vec<u8>>,
}

/// Broadcast channel of state mutations with monotonic sequence numbers.
/// Controllers subscribe to requeue reconciliation on relevant changes.
#[derive(Clone)]
pub struct EventLog {
    seq: Arc<AtomicU64>,
    sender: broadcast::Sender<WatchEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            seq: Arc::new(AtomicU64::new(0)),
            sender,
        }
    }

    /// Record a new event. Called internally by StateStore on put/delete.
    pub fn emit(
        &self,
        event_type: EventType,
        key: String,
        value: Option<Vec<u8>>,
        prior: Option<Vec<u8>>,
    ) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let event = WatchEvent {
            seq,
            event_type,
            key,
            value,
            prior,
        };
        // Ignore errors if no receivers
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive new events as they are emitted.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
