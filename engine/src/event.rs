//! Change-feed events and user mutations.
//!
//! Remote changes arrive as [`ChangeEvent`]s; local intent is expressed as
//! [`Mutation`]s. Neither touches a mirror directly: both are fed through
//! the reconciliation engine's merge operations.

use crate::{Entity, EntityId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An event delivered by the change feed (at-least-once, unordered).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "entity", rename_all = "lowercase")]
pub enum ChangeEvent {
    Insert(Entity),
    Update(Entity),
    /// Carries the last known state of the deleted entity
    Delete(Entity),
}

impl ChangeEvent {
    /// Get the entity carried by this event.
    pub fn entity(&self) -> &Entity {
        match self {
            ChangeEvent::Insert(e) | ChangeEvent::Update(e) | ChangeEvent::Delete(e) => e,
        }
    }

    /// Get the id of the entity this event targets.
    pub fn entity_id(&self) -> &EntityId {
        &self.entity().id
    }

    /// Get the event type as a static label (for logging).
    pub fn label(&self) -> &'static str {
        match self {
            ChangeEvent::Insert(_) => "insert",
            ChangeEvent::Update(_) => "update",
            ChangeEvent::Delete(_) => "delete",
        }
    }
}

/// The kind of a user mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
    Toggle,
}

/// A user-initiated write against one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Mutation {
    /// Create a new entity from a draft payload
    Create { payload: Value },
    /// Shallow-merge `patch` into an entity's payload
    #[serde(rename_all = "camelCase")]
    Update {
        id: EntityId,
        patch: Map<String, Value>,
    },
    /// Remove an entity
    Delete { id: EntityId },
    /// Set or clear the current user's marker on `target_id`
    #[serde(rename_all = "camelCase")]
    Toggle { target_id: EntityId, flag: bool },
}

impl Mutation {
    pub fn create(payload: Value) -> Self {
        Mutation::Create { payload }
    }

    /// Build an update from a JSON object; non-object patches become empty.
    pub fn update(id: impl Into<EntityId>, patch: Value) -> Self {
        let patch = match patch {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Mutation::Update {
            id: id.into(),
            patch,
        }
    }

    pub fn delete(id: impl Into<EntityId>) -> Self {
        Mutation::Delete { id: id.into() }
    }

    pub fn toggle(target_id: impl Into<EntityId>, flag: bool) -> Self {
        Mutation::Toggle {
            target_id: target_id.into(),
            flag,
        }
    }

    /// Get the mutation kind.
    pub fn kind(&self) -> MutationKind {
        match self {
            Mutation::Create { .. } => MutationKind::Create,
            Mutation::Update { .. } => MutationKind::Update,
            Mutation::Delete { .. } => MutationKind::Delete,
            Mutation::Toggle { .. } => MutationKind::Toggle,
        }
    }

    /// Get the targeted entity id, if the mutation has one.
    pub fn target_id(&self) -> Option<&EntityId> {
        match self {
            Mutation::Create { .. } => None,
            Mutation::Update { id, .. } | Mutation::Delete { id } => Some(id),
            Mutation::Toggle { target_id, .. } => Some(target_id),
        }
    }
}
