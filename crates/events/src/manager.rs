//! Webhook subscription lifecycle management.
//!
//! [`WebhookManager`] bridges the subscription-management API and the
//! event bus: it attaches one [`WebhookPublisher`] per enabled
//! subscription, applies runtime reconfiguration to live publishers,
//! replaces terminated ones, and detaches publishers so that callers can
//! assume no further deliveries once [`detach`](WebhookManager::detach)
//! returns.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;
use validator::Validate;

use crate::bus::{ConsumerHandle, EventBus};
use crate::delivery::status::{DeliveryState, NoopStatusSink, StatusSink, WebhookStatus};
use crate::delivery::subscription::Webhook;
use crate::delivery::webhook::{PublisherCommand, WebhookPublisher};
use crate::error::ManagerError;

/// A live publisher registration.
struct PublisherEntry {
    commands: mpsc::UnboundedSender<PublisherCommand>,
    state: watch::Receiver<DeliveryState>,
    consumer: ConsumerHandle,
}

/// Runtime registry of webhook publishers, one per enabled subscription.
pub struct WebhookManager {
    bus: Arc<EventBus>,
    sink: Arc<dyn StatusSink>,
    publishers: Mutex<HashMap<Uuid, PublisherEntry>>,
}

impl WebhookManager {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_sink(bus, Arc::new(NoopStatusSink))
    }

    /// Create a manager that records every status transition through
    /// `sink`.
    pub fn with_sink(bus: Arc<EventBus>, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            bus,
            sink,
            publishers: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a subscription.
    ///
    /// Disabled subscriptions only record `Disabled` status and never
    /// touch the bus; enabled ones get a publisher registered from the
    /// current tail of the event stream.
    pub async fn attach(&self, webhook: Webhook) -> Result<(), ManagerError> {
        webhook.validate()?;

        if !webhook.enabled {
            tracing::info!(webhook = %webhook.name, "Webhook disabled, not attaching");
            self.sink
                .record(webhook.id, &DeliveryState::new(WebhookStatus::Disabled))
                .await;
            return Ok(());
        }

        self.spawn_publisher(webhook).await
    }

    /// Apply a configuration update.
    ///
    /// Disabling detaches the publisher. An enabled update reaches a live
    /// publisher in place (resetting its backoff ladder and rebuilding
    /// its HTTP client); a terminated or unknown publisher is replaced by
    /// a fresh instance attached to the bus.
    pub async fn reconfigure(&self, webhook: Webhook) -> Result<(), ManagerError> {
        webhook.validate()?;

        if !webhook.enabled {
            self.detach(webhook.id).await;
            self.sink
                .record(webhook.id, &DeliveryState::new(WebhookStatus::Disabled))
                .await;
            return Ok(());
        }

        let mut publishers = self.publishers.lock().await;
        if let Some(entry) = publishers.remove(&webhook.id) {
            if !entry.consumer.is_terminated()
                && entry
                    .commands
                    .send(PublisherCommand::Reconfigure(webhook.clone()))
                    .is_ok()
            {
                tracing::info!(webhook = %webhook.name, "Webhook publisher reconfigured in place");
                publishers.insert(webhook.id, entry);
                return Ok(());
            }
            // The previous publisher stopped for good; replace it.
            self.bus.remove_consumer(entry.consumer).await;
        }
        drop(publishers);

        self.spawn_publisher(webhook).await
    }

    /// Detach a subscription and wait for its consumer to stop. Returns
    /// whether a publisher was attached. No further deliveries happen
    /// once this returns.
    pub async fn detach(&self, id: Uuid) -> bool {
        let entry = self.publishers.lock().await.remove(&id);
        match entry {
            Some(entry) => {
                // Break any in-progress backoff sleep before removal.
                let _ = entry.commands.send(PublisherCommand::Shutdown);
                self.bus.remove_consumer(entry.consumer).await;
                tracing::info!(webhook_id = %id, "Webhook publisher detached");
                true
            }
            None => false,
        }
    }

    /// Live delivery state of an attached subscription.
    pub async fn status(&self, id: Uuid) -> Option<DeliveryState> {
        self.publishers
            .lock()
            .await
            .get(&id)
            .map(|entry| entry.state.borrow().clone())
    }

    /// Whether the subscription currently has a live (non-terminated)
    /// publisher.
    pub async fn is_attached(&self, id: Uuid) -> bool {
        self.publishers
            .lock()
            .await
            .get(&id)
            .is_some_and(|entry| !entry.consumer.is_terminated())
    }

    /// Detach every subscription, then shut the bus down.
    pub async fn shutdown(&self) {
        let ids: Vec<Uuid> = self.publishers.lock().await.keys().copied().collect();
        for id in ids {
            self.detach(id).await;
        }
        self.bus.shutdown().await;
    }

    async fn spawn_publisher(&self, webhook: Webhook) -> Result<(), ManagerError> {
        let id = webhook.id;
        let name = webhook.name.clone();
        let (publisher, commands, state) = WebhookPublisher::new(webhook, Arc::clone(&self.sink));
        let consumer = self.bus.add_consumer(publisher)?;

        let mut publishers = self.publishers.lock().await;
        if let Some(previous) = publishers.insert(
            id,
            PublisherEntry {
                commands,
                state,
                consumer,
            },
        ) {
            // A stale registration for the same id must not keep gating
            // the writer.
            self.bus.remove_consumer(previous.consumer).await;
        }
        tracing::info!(webhook = %name, "Webhook subscription started");
        Ok(())
    }
}
