//! Event bus for monitoring events.
//!
//! Subscribers receive every event published after they subscribe and
//! unsubscribe by dropping their receiver.

use crate::db::{AlertEvent, RunStatus};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Maximum number of events buffered in the broadcast channel.
const EVENT_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    RunCompleted {
        server_id: i64,
        collector_id: i64,
        status: RunStatus,
    },
    AlertRaised(AlertEvent),
    AlertCleared(AlertEvent),
    HungCollector {
        server_id: i64,
        collector_id: i64,
        running_since: DateTime<Utc>,
    },
    CollectorSuspended {
        server_id: i64,
        collector_id: i64,
        reason: String,
    },
    StoreWriteFailed {
        server_id: i64,
        collector_id: i64,
        error: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MonitorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: MonitorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new();
        bus.publish(MonitorEvent::RunCompleted { server_id: 1, collector_id: 1, status: RunStatus::Success });

        let mut rx = bus.subscribe();
        bus.publish(MonitorEvent::StoreWriteFailed {
            server_id: 2,
            collector_id: 3,
            error: "disk I/O error".to_string(),
        });
        match rx.recv().await.unwrap() {
            MonitorEvent::StoreWriteFailed { server_id, .. } => assert_eq!(server_id, 2),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
