//! Alert delivery.

use crate::db::AlertEvent;
use crate::events::{EventBus, MonitorEvent};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("notifier rejected alert: {0}")]
    Rejected(String),
}

/// Delivers raised alerts somewhere a human will see them.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, event: &AlertEvent) -> Result<(), NotifyError>;
}

/// Writes alerts to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, event: &AlertEvent) -> Result<(), NotifyError> {
        tracing::warn!(
            "ALERT [{}] server {} at {}: {}",
            event.kind,
            event.server_id,
            event.triggered_at,
            event.details
        );
        Ok(())
    }
}

/// POSTs each alert as JSON to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, event: &AlertEvent) -> Result<(), NotifyError> {
        let response = self.client.post(&self.url).json(event).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Rejected(format!("{} returned {}", self.url, response.status())));
        }
        Ok(())
    }
}

/// Forward every raised alert on the bus to each notifier.
///
/// A failed delivery is retried once. Cleared alerts are not delivered.
/// The task ends when the bus is dropped.
pub fn spawn_dispatcher(bus: &EventBus, notifiers: Vec<Arc<dyn Notifier>>) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(MonitorEvent::AlertRaised(event)) => event,
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Notifier: dropped {} events, dispatcher fell behind", n);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            for notifier in &notifiers {
                deliver(notifier.as_ref(), &event).await;
            }
        }
    })
}

async fn deliver(notifier: &dyn Notifier, event: &AlertEvent) {
    if let Err(first) = notifier.send(event).await {
        tracing::warn!("Notifier: {} failed for alert {}, retrying: {}", notifier.name(), event.id, first);
        tokio::time::sleep(RETRY_DELAY).await;
        if let Err(e) = notifier.send(event).await {
            tracing::error!("Notifier: {} gave up on alert {}: {}", notifier.name(), event.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::AlertKind;
    use chrono::Utc;
    use std::sync::Mutex;

    struct Recording {
        failures_left: Mutex<u32>,
        attempts: Mutex<u32>,
        delivered: Mutex<Vec<i64>>,
    }

    impl Recording {
        fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                failures_left: Mutex::new(times),
                attempts: Mutex::new(0),
                delivered: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Notifier for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, event: &AlertEvent) -> Result<(), NotifyError> {
            *self.attempts.lock().unwrap() += 1;
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(NotifyError::Rejected("unavailable".into()));
            }
            self.delivered.lock().unwrap().push(event.id);
            Ok(())
        }
    }

    fn event(id: i64) -> AlertEvent {
        AlertEvent {
            id,
            server_id: 1,
            kind: AlertKind::Cpu,
            triggered_at: Utc::now(),
            dedup_key: "cpu".to_string(),
            details: "CPU at 91.0%".to_string(),
            cleared_at: None,
        }
    }

    #[tokio::test]
    async fn test_retries_once_and_skips_cleared() {
        let bus = EventBus::new();
        let flaky = Recording::failing(1);
        let dead = Recording::failing(u32::MAX);
        let notifiers: Vec<Arc<dyn Notifier>> = vec![flaky.clone(), dead.clone(), Arc::new(LogNotifier)];
        let handle = spawn_dispatcher(&bus, notifiers);

        bus.publish(MonitorEvent::AlertRaised(event(7)));
        bus.publish(MonitorEvent::AlertCleared(event(7)));
        drop(bus);
        handle.await.unwrap();

        assert_eq!(*flaky.delivered.lock().unwrap(), vec![7]);
        assert_eq!(*flaky.attempts.lock().unwrap(), 2);
        assert!(dead.delivered.lock().unwrap().is_empty());
        assert_eq!(*dead.attempts.lock().unwrap(), 2);
    }
}
