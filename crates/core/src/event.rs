//! Canonical change-event envelope.
//!
//! [`ChangeEvent`] is the immutable description of one entity mutation,
//! produced exactly once by the storage layer after the mutation is
//! durably committed. Constructed via [`ChangeEvent::new`] and enriched
//! with the builder methods [`with_user`](ChangeEvent::with_user),
//! [`with_versions`](ChangeEvent::with_versions),
//! [`with_entity`](ChangeEvent::with_entity), and
//! [`with_change_description`](ChangeEvent::with_change_description).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{EntityVersion, Timestamp};

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

/// The kind of mutation a [`ChangeEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    EntityCreated,
    EntityUpdated,
    EntitySoftDeleted,
    EntityDeleted,
}

// ---------------------------------------------------------------------------
// ChangeEvent
// ---------------------------------------------------------------------------

/// A domain event describing one entity mutation.
///
/// Create events carry the full entity body in `entity`; update events
/// carry a structured field diff in `change_description`; delete events
/// carry neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub event_type: EventKind,

    /// Entity type name, e.g. `"table"`, `"pipeline"`, `"user"`.
    pub entity_type: String,

    /// Id of the mutated entity.
    pub entity_id: Uuid,

    /// Name of the user that performed the mutation.
    pub user_name: String,

    /// When the mutation was committed (UTC).
    pub timestamp: Timestamp,

    /// Entity version before the mutation; `None` on create.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<EntityVersion>,

    /// Entity version after the mutation.
    pub current_version: EntityVersion,

    /// Full entity body; present on create events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<serde_json::Value>,

    /// Field-level diff; present on update events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_description: Option<ChangeDescription>,
}

impl ChangeEvent {
    /// Create a new event with the required identity fields.
    ///
    /// Versions default to an initial `0.1`, the acting user to
    /// `"system"`, and the payload fields to `None`.
    pub fn new(event_type: EventKind, entity_type: impl Into<String>, entity_id: Uuid) -> Self {
        Self {
            event_type,
            entity_type: entity_type.into(),
            entity_id,
            user_name: "system".to_string(),
            timestamp: Utc::now(),
            previous_version: None,
            current_version: 0.1,
            entity: None,
            change_description: None,
        }
    }

    /// Attach the acting user.
    pub fn with_user(mut self, user_name: impl Into<String>) -> Self {
        self.user_name = user_name.into();
        self
    }

    /// Set the previous and current entity versions.
    pub fn with_versions(mut self, previous: Option<EntityVersion>, current: EntityVersion) -> Self {
        self.previous_version = previous;
        self.current_version = current;
        self
    }

    /// Attach the full entity body (create events).
    pub fn with_entity(mut self, entity: serde_json::Value) -> Self {
        self.entity = Some(entity);
        self
    }

    /// Attach a field-level diff (update events).
    pub fn with_change_description(mut self, change: ChangeDescription) -> Self {
        self.change_description = Some(change);
        self
    }
}

// ---------------------------------------------------------------------------
// ChangeDescription
// ---------------------------------------------------------------------------

/// Structured diff of the fields touched by an update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDescription {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields_added: Vec<FieldChange>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields_updated: Vec<FieldChange>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields_deleted: Vec<FieldChange>,
}

/// One changed field inside a [`ChangeDescription`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    /// Dotted field path, e.g. `"description"` or `"columns.id.tags"`.
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
