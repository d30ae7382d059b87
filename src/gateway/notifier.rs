//! Registry change notifications.
//!
//! When a server's circuit opens its tools effectively leave the catalog; when
//! it recovers they come back. Interested parties learn about it through a
//! bounded queue drained by a background task, so publishing never blocks or
//! fails the request that caused the transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::circuit_breaker::Transition;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryChangeKind {
    ServerUnavailable,
    ServerRestored,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryChange {
    pub kind: RegistryChangeKind,
    pub server: String,
    pub timestamp: DateTime<Utc>,
}

impl RegistryChange {
    /// Maps a breaker transition to a catalog change. Re-opening a circuit
    /// that was already unavailable is not a change.
    pub fn from_transition(server: &str, transition: Transition) -> Option<Self> {
        let kind = match transition {
            Transition::Opened => RegistryChangeKind::ServerUnavailable,
            Transition::Recovered => RegistryChangeKind::ServerRestored,
            Transition::Reopened => return None,
        };
        Some(Self {
            kind,
            server: server.to_string(),
            timestamp: Utc::now(),
        })
    }
}

#[async_trait]
pub trait RegistryChangeSubscriber: Send + Sync {
    fn name(&self) -> &str;
    async fn on_change(&self, change: &RegistryChange) -> anyhow::Result<()>;
}

/// Writes every change to the log.
pub struct LogSubscriber;

#[async_trait]
impl RegistryChangeSubscriber for LogSubscriber {
    fn name(&self) -> &str {
        "log"
    }

    async fn on_change(&self, change: &RegistryChange) -> anyhow::Result<()> {
        match change.kind {
            RegistryChangeKind::ServerUnavailable => {
                info!("Tools of server {} left the catalog", change.server)
            }
            RegistryChangeKind::ServerRestored => {
                info!("Tools of server {} are back in the catalog", change.server)
            }
        }
        Ok(())
    }
}

/// POSTs each change as JSON to a fixed URL.
pub struct WebhookSubscriber {
    client: reqwest::Client,
    url: String,
}

impl WebhookSubscriber {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl RegistryChangeSubscriber for WebhookSubscriber {
    fn name(&self) -> &str {
        &self.url
    }

    async fn on_change(&self, change: &RegistryChange) -> anyhow::Result<()> {
        let response = self.client.post(&self.url).json(change).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("webhook returned status {}", response.status());
        }
        Ok(())
    }
}

/// Publishing end of the notification queue. Cheap to clone.
#[derive(Clone)]
pub struct RegistryNotifier {
    sender: Option<mpsc::Sender<RegistryChange>>,
}

impl RegistryNotifier {
    /// Starts the delivery task. Must be called inside a tokio runtime.
    pub fn spawn(capacity: usize, subscribers: Vec<Arc<dyn RegistryChangeSubscriber>>) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        tokio::spawn(deliver(receiver, subscribers));
        Self {
            sender: Some(sender),
        }
    }

    /// A notifier that drops everything.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Enqueues `change` without waiting. Drops it when the queue is full.
    pub fn publish(&self, change: RegistryChange) {
        let Some(sender) = &self.sender else {
            return;
        };
        match sender.try_send(change) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(change)) => {
                crate::server::metrics::record_notification_dropped();
                warn!(
                    "Notification queue full, dropping change for server {}",
                    change.server
                );
            }
            Err(mpsc::error::TrySendError::Closed(change)) => {
                warn!(
                    "Notification queue closed, dropping change for server {}",
                    change.server
                );
            }
        }
    }
}

async fn deliver(
    mut receiver: mpsc::Receiver<RegistryChange>,
    subscribers: Vec<Arc<dyn RegistryChangeSubscriber>>,
) {
    while let Some(change) = receiver.recv().await {
        for subscriber in &subscribers {
            match subscriber.on_change(&change).await {
                Ok(()) => debug!(
                    "Delivered {:?} for {} to {}",
                    change.kind,
                    change.server,
                    subscriber.name()
                ),
                Err(e) => warn!(
                    "Subscriber {} failed to handle change for {}: {:#}",
                    subscriber.name(),
                    change.server,
                    e
                ),
            }
        }
    }
    debug!("Notification queue drained, delivery task exiting");
}
