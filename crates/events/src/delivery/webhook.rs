//! Webhook delivery publisher.
//!
//! [`WebhookPublisher`] is the bus consumer for one webhook subscription.
//! It filters events against the subscription's filters, batches them,
//! and POSTs each batch as a JSON array to the endpoint, optionally
//! signing the body. Transient failures (4xx, 5xx, timeouts) are retried
//! along the backoff ladder until the batch is confirmed; permanent
//! failures (3xx responses, unresolvable hosts) are treated as
//! configuration errors and terminate the publisher.
//!
//! Reconfiguration and shutdown arrive on a command channel drained
//! inside the publisher's own loop, so no external thread ever touches
//! its state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use tokio::sync::{mpsc, watch};

use metacat_core::event::ChangeEvent;
use metacat_core::signing::hmac_sha256_hex;

use crate::bus::EventConsumer;
use crate::delivery::backoff::Backoff;
use crate::delivery::status::{DeliveryState, StatusSink, WebhookStatus};
use crate::delivery::subscription::{FilterMap, Webhook};
use crate::error::ConsumerError;

/// Header carrying the HMAC-SHA256 signature of the request body.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

// ---------------------------------------------------------------------------
// Commands and attempt outcomes
// ---------------------------------------------------------------------------

/// Control messages applied inside the publisher's own loop.
#[derive(Debug)]
pub enum PublisherCommand {
    /// Replace the live configuration: rebuilds the HTTP client and the
    /// filter index and resets the backoff ladder.
    Reconfigure(Webhook),
    /// Stop delivering; the consumer exits at its next loop point.
    Shutdown,
}

/// Outcome of a single delivery attempt.
enum AttemptOutcome {
    /// 2xx: the batch is confirmed.
    Delivered,
    /// 4xx, 5xx, timeout, or a connection failure to a resolvable host:
    /// retry along the ladder.
    Transient {
        status_code: Option<u16>,
        reason: String,
    },
    /// 3xx response or unresolvable host: configuration error, stop for
    /// good.
    Permanent {
        status_code: Option<u16>,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// WebhookPublisher
// ---------------------------------------------------------------------------

/// Delivery worker for one webhook subscription.
///
/// One instance per enabled subscription, registered as a bus consumer;
/// all of its state is owned by its consumer task.
pub struct WebhookPublisher {
    webhook: Webhook,
    filter: FilterMap,
    batch: Vec<Arc<ChangeEvent>>,
    backoff: Backoff,
    client: reqwest::Client,
    commands: mpsc::UnboundedReceiver<PublisherCommand>,
    state: DeliveryState,
    state_tx: watch::Sender<DeliveryState>,
    sink: Arc<dyn StatusSink>,
    stopping: bool,
}

impl WebhookPublisher {
    /// Build a publisher for `webhook`, returning the command sender used
    /// for reconfiguration/shutdown and a watch receiver observing every
    /// state transition.
    pub fn new(
        webhook: Webhook,
        sink: Arc<dyn StatusSink>,
    ) -> (
        Self,
        mpsc::UnboundedSender<PublisherCommand>,
        watch::Receiver<DeliveryState>,
    ) {
        let (cmd_tx, commands) = mpsc::unbounded_channel();
        let state = DeliveryState::new(WebhookStatus::Active);
        let (state_tx, state_rx) = watch::channel(state.clone());
        let filter = FilterMap::from_filters(&webhook.event_filters);
        let client = build_client(webhook.timeout_secs);

        let publisher = Self {
            filter,
            batch: Vec::new(),
            backoff: Backoff::new(),
            client,
            commands,
            state,
            state_tx,
            sink,
            stopping: false,
            webhook,
        };
        (publisher, cmd_tx, state_rx)
    }

    fn drain_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(PublisherCommand::Reconfigure(webhook)) => self.apply_config(webhook),
                Ok(PublisherCommand::Shutdown) => self.stopping = true,
                Err(_) => break,
            }
        }
    }

    fn apply_config(&mut self, webhook: Webhook) {
        tracing::info!(webhook = %webhook.name, "Webhook publisher reconfigured");
        self.filter = FilterMap::from_filters(&webhook.event_filters);
        self.client = build_client(webhook.timeout_secs);
        self.backoff.reset();
        self.webhook = webhook;
    }

    /// Publish the current state on the watch channel and record it
    /// through the sink.
    async fn publish_state(&self) {
        self.state_tx.send_replace(self.state.clone());
        self.sink.record(self.webhook.id, &self.state).await;
    }

    /// Deliver the in-flight batch, retrying transient failures along the
    /// ladder until it is confirmed, the publisher is told to shut down,
    /// or a permanent error terminates it.
    async fn deliver_batch(&mut self) -> Result<(), ConsumerError> {
        while !self.stopping {
            let body = serde_json::to_vec(&self.batch)
                .map_err(|err| ConsumerError::new(format!("failed to encode batch: {err}")))?;
            let attempted_at = Utc::now();

            match self.attempt(&body).await {
                AttemptOutcome::Delivered => {
                    tracing::info!(
                        webhook = %self.webhook.name,
                        batch_size = self.batch.len(),
                        "Webhook batch delivered"
                    );
                    let newest = self.batch.last().map(|event| event.timestamp);
                    self.batch.clear();
                    self.backoff.reset();
                    self.state.record_success(newest.unwrap_or(attempted_at));
                    self.publish_state().await;
                    return Ok(());
                }
                AttemptOutcome::Transient {
                    status_code,
                    reason,
                } => {
                    let wait = self.backoff.advance();
                    tracing::warn!(
                        webhook = %self.webhook.name,
                        status_code = ?status_code,
                        reason = %reason,
                        wait_secs = wait.as_secs(),
                        "Webhook delivery failed, will retry"
                    );
                    let next_attempt = attempted_at + chrono::Duration::seconds(wait.as_secs() as i64);
                    if self.state.record_failure(
                        WebhookStatus::AwaitingRetry,
                        attempted_at,
                        status_code,
                        &reason,
                        Some(next_attempt),
                    ) {
                        self.publish_state().await;
                    }
                    self.backoff_sleep(wait).await;
                }
                AttemptOutcome::Permanent {
                    status_code,
                    reason,
                } => {
                    tracing::warn!(
                        webhook = %self.webhook.name,
                        status_code = ?status_code,
                        reason = %reason,
                        "Webhook delivery failed permanently, stopping"
                    );
                    if self.state.record_failure(
                        WebhookStatus::Failed,
                        attempted_at,
                        status_code,
                        &reason,
                        None,
                    ) {
                        self.publish_state().await;
                    }
                    return Err(ConsumerError::new(reason));
                }
            }
        }
        Ok(())
    }

    /// Execute one POST of `body` and classify the result.
    async fn attempt(&self, body: &[u8]) -> AttemptOutcome {
        let mut request = self
            .client
            .post(self.webhook.endpoint.as_str())
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec());

        if let Some(secret) = self.webhook.secret_key.as_deref().filter(|s| !s.is_empty()) {
            let signature = hmac_sha256_hex(secret, body);
            request = request.header(SIGNATURE_HEADER, format!("sha256={signature}"));
        }

        match request.send().await {
            Ok(response) => classify_response(response.status()),
            Err(err) if err.is_timeout() => AttemptOutcome::Transient {
                status_code: None,
                reason: format!("request timed out: {err}"),
            },
            Err(err) => {
                // reqwest folds DNS failure into a generic connect error;
                // probe the host to tell an unresolvable endpoint apart
                // from a transiently unreachable one.
                if endpoint_resolves(&self.webhook.endpoint).await {
                    AttemptOutcome::Transient {
                        status_code: None,
                        reason: format!("request failed: {err}"),
                    }
                } else {
                    AttemptOutcome::Permanent {
                        status_code: None,
                        reason: format!("unresolvable host: {}", self.webhook.endpoint),
                    }
                }
            }
        }
    }

    /// Sleep out one backoff step while staying responsive to commands: a
    /// reconfigure ends the sleep early (the ladder was just reset), a
    /// shutdown stops delivery.
    async fn backoff_sleep(&mut self, wait: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            cmd = self.commands.recv() => match cmd {
                Some(PublisherCommand::Reconfigure(webhook)) => self.apply_config(webhook),
                Some(PublisherCommand::Shutdown) | None => self.stopping = true,
            },
        }
    }
}

#[async_trait]
impl EventConsumer for WebhookPublisher {
    async fn on_start(&mut self) {
        tracing::info!(webhook = %self.webhook.name, "Webhook publisher started");
        self.publish_state().await;
    }

    async fn on_event(
        &mut self,
        event: Arc<ChangeEvent>,
        end_of_batch: bool,
    ) -> Result<(), ConsumerError> {
        self.drain_commands();
        if self.stopping {
            return Ok(());
        }

        if !self.filter.matches(&event) {
            return Ok(());
        }

        // Accumulate until the backlog is momentarily exhausted or the
        // batch is full.
        self.batch.push(event);
        if !end_of_batch && self.batch.len() < self.webhook.batch_size {
            return Ok(());
        }

        self.deliver_batch().await
    }

    async fn on_shutdown(&mut self) {
        self.backoff.reset();
        tracing::info!(webhook = %self.webhook.name, "Webhook publisher stopped");
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Redirects are disabled so that a 3xx response reaches the state
/// machine instead of being followed.
fn build_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .redirect(Policy::none())
        .build()
        .expect("Failed to build reqwest HTTP client")
}

fn classify_response(status: StatusCode) -> AttemptOutcome {
    let code = status.as_u16();
    let reason = status
        .canonical_reason()
        .unwrap_or("unknown status")
        .to_string();
    match code {
        200..=299 => AttemptOutcome::Delivered,
        300..=399 => AttemptOutcome::Permanent {
            status_code: Some(code),
            reason,
        },
        _ => AttemptOutcome::Transient {
            status_code: Some(code),
            reason,
        },
    }
}

/// Whether the endpoint's host currently resolves to at least one
/// address.
async fn endpoint_resolves(endpoint: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(endpoint) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    let port = url.port_or_known_default().unwrap_or(443);
    let resolved = match tokio::net::lookup_host((host, port)).await {
        Ok(mut addrs) => addrs.next().is_some(),
        Err(_) => false,
    };
    resolved
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
