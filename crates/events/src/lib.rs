//! Metacat change-event distribution and webhook delivery.
//!
//! Every entity mutation in the catalog produces one
//! [`ChangeEvent`](metacat_core::event::ChangeEvent), published once into
//! the process-wide [`EventBus`] and fanned out to every registered
//! consumer. The building blocks:
//!
//! - [`bus`] — bounded multi-consumer broadcast with backpressure; one
//!   dedicated task per consumer, identical total order for all.
//! - [`delivery`] — the webhook channel: per-subscription publisher with
//!   filtering, batching, signed HTTP delivery, and a retry/backoff state
//!   machine.
//! - [`manager`] — runtime lifecycle of webhook subscriptions
//!   (attach / reconfigure / detach).

pub mod bus;
pub mod delivery;
pub mod error;
pub mod manager;

pub use bus::{ConsumerHandle, EventBus, EventConsumer, FnConsumer, DEFAULT_CAPACITY};
pub use delivery::status::{
    DeliveryState, FailureDetails, NoopStatusSink, StatusSink, WebhookStatus,
};
pub use delivery::subscription::{EventFilter, Webhook};
pub use delivery::webhook::WebhookPublisher;
pub use error::{BusError, ConsumerError, ManagerError};
pub use manager::WebhookManager;
