//! Error types for the event bus and the webhook delivery layer.

/// Errors surfaced by [`EventBus`](crate::bus::EventBus) operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The bus has shut down; no further publishes or registrations are
    /// accepted.
    #[error("event bus is closed")]
    Closed,
}

/// Terminal error returned from a consumer's `on_event`.
///
/// Returning this retires the consumer: it stops receiving events and its
/// handle reports [`is_terminated`](crate::bus::ConsumerHandle::is_terminated),
/// but it stays registered until explicitly removed.
#[derive(Debug, thiserror::Error)]
#[error("consumer terminated: {reason}")]
pub struct ConsumerError {
    pub reason: String,
}

impl ConsumerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by [`WebhookManager`](crate::manager::WebhookManager).
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// The webhook configuration failed validation.
    #[error("invalid webhook configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),

    /// The underlying event bus rejected the operation.
    #[error(transparent)]
    Bus(#[from] BusError),
}
