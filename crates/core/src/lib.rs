//! Metacat shared domain model.
//!
//! This crate holds the types shared between the entity layer and the
//! event/delivery infrastructure:
//!
//! - [`event`] — the canonical [`ChangeEvent`](event::ChangeEvent)
//!   envelope produced once per entity mutation.
//! - [`types`] — common type aliases.
//! - [`signing`] — HMAC payload signing for webhook deliveries.

pub mod event;
pub mod signing;
pub mod types;

pub use event::{ChangeDescription, ChangeEvent, EventKind, FieldChange};
pub use types::{EntityVersion, Timestamp};
