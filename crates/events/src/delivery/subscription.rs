//! Webhook subscription configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use metacat_core::event::{ChangeEvent, EventKind};

/// Default number of events per delivery batch.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default per-request HTTP timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

// ---------------------------------------------------------------------------
// Webhook
// ---------------------------------------------------------------------------

/// Matches one event kind to the entity types it should be delivered for.
///
/// `"*"` in `entities` matches every entity type. A kind with no filter
/// entry, or an empty `entities` list, matches nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    pub event_type: EventKind,
    pub entities: Vec<String>,
}

/// Configuration of one webhook subscription.
///
/// Managed through the subscription API; any change must reach the live
/// publisher without a restart, which
/// [`WebhookManager::reconfigure`](crate::manager::WebhookManager::reconfigure)
/// takes care of.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub id: Uuid,

    #[validate(length(min = 1, max = 128))]
    pub name: String,

    /// Target URL events are POSTed to.
    #[validate(url)]
    pub endpoint: String,

    pub enabled: bool,

    /// Events accumulated before a delivery is forced.
    #[validate(range(min = 1, max = 100))]
    pub batch_size: usize,

    /// Per-request HTTP timeout in seconds.
    #[validate(range(min = 1, max = 300))]
    pub timeout_secs: u64,

    /// Shared secret for the `X-Webhook-Signature` header; no signature
    /// is sent when absent or empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,

    pub event_filters: Vec<EventFilter>,
}

impl Webhook {
    /// Create an enabled subscription with default batching and timeout
    /// and no filters (which delivers nothing until filters are added).
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            endpoint: endpoint.into(),
            enabled: true,
            batch_size: DEFAULT_BATCH_SIZE,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            secret_key: None,
            event_filters: Vec::new(),
        }
    }

    /// Add a filter entry for one event kind.
    pub fn with_filter<I, S>(mut self, event_type: EventKind, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_filters.push(EventFilter {
            event_type,
            entities: entities.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret_key = Some(secret.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

// ---------------------------------------------------------------------------
// FilterMap
// ---------------------------------------------------------------------------

/// Kind-indexed view of a subscription's filters.
#[derive(Debug, Clone, Default)]
pub struct FilterMap {
    by_kind: HashMap<EventKind, Vec<String>>,
}

impl FilterMap {
    pub fn from_filters(filters: &[EventFilter]) -> Self {
        let mut by_kind = HashMap::new();
        for filter in filters {
            by_kind.insert(filter.event_type, filter.entities.clone());
        }
        Self { by_kind }
    }

    /// Whether `event` passes the subscription's filters.
    ///
    /// A kind without an entry (or with an empty entity list) matches
    /// nothing; `"*"` matches every entity type.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match self.by_kind.get(&event.event_type) {
            Some(entities) => entities
                .iter()
                .any(|e| e == "*" || *e == event.entity_type),
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
