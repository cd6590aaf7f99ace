//! Delivery status model and the persistence port.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use metacat_core::types::Timestamp;

// ---------------------------------------------------------------------------
// Status model
// ---------------------------------------------------------------------------

/// Lifecycle status of a subscription's delivery pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WebhookStatus {
    /// Delivering normally.
    Active,
    /// A transient failure occurred; the next attempt is scheduled.
    AwaitingRetry,
    /// A permanent failure occurred; no further deliveries until the
    /// subscription is edited or recreated.
    Failed,
    /// The subscription is disabled and not attached to the bus.
    Disabled,
}

/// Details of the most recent delivery failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDetails {
    pub last_failed_at: Option<Timestamp>,
    pub last_failed_status_code: Option<u16>,
    pub last_failed_reason: Option<String>,
    pub next_attempt: Option<Timestamp>,
}

/// Snapshot of one subscription's delivery state, published on every
/// transition and recorded through the [`StatusSink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryState {
    pub status: WebhookStatus,
    pub failure_details: FailureDetails,
    pub last_successful_at: Option<Timestamp>,
}

impl DeliveryState {
    pub fn new(status: WebhookStatus) -> Self {
        Self {
            status,
            failure_details: FailureDetails::default(),
            last_successful_at: None,
        }
    }

    /// Record a failed attempt, returning whether anything changed.
    ///
    /// A failure already recorded at the same attempt timestamp is not
    /// recorded twice.
    pub(crate) fn record_failure(
        &mut self,
        status: WebhookStatus,
        attempted_at: Timestamp,
        status_code: Option<u16>,
        reason: &str,
        next_attempt: Option<Timestamp>,
    ) -> bool {
        if self.failure_details.last_failed_at == Some(attempted_at) {
            return false;
        }
        self.status = status;
        self.failure_details = FailureDetails {
            last_failed_at: Some(attempted_at),
            last_failed_status_code: status_code,
            last_failed_reason: Some(reason.to_string()),
            next_attempt,
        };
        true
    }

    /// Record a confirmed delivery: back to `Active` with failure
    /// details cleared.
    pub(crate) fn record_success(&mut self, delivered_at: Timestamp) {
        self.status = WebhookStatus::Active;
        self.failure_details = FailureDetails::default();
        self.last_successful_at = Some(delivered_at);
    }
}

// ---------------------------------------------------------------------------
// StatusSink
// ---------------------------------------------------------------------------

/// Port through which delivery status reaches the storage layer.
///
/// The catalog's storage layer implements this to persist subscription
/// status and failure details for operator visibility.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn record(&self, webhook_id: Uuid, state: &DeliveryState);
}

/// Sink for embedders that do not persist delivery status.
pub struct NoopStatusSink;

#[async_trait]
impl StatusSink for NoopStatusSink {
    async fn record(&self, _webhook_id: Uuid, _state: &DeliveryState) {}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
