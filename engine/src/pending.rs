//! Bookkeeping for optimistic mutations that have not been resolved yet.

use crate::{Entity, EntityId, JoinKey, LocalId, MutationKind, Revision, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle of a pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationStatus {
    InFlight,
    Confirmed,
    Failed,
}

/// A local write whose remote outcome is not known yet.
///
/// While `InFlight`, the mirror shows `speculative_entity` (or, for
/// deletes, the absence of the target).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    pub local_id: LocalId,
    pub kind: MutationKind,
    pub target_id: Option<EntityId>,
    pub speculative_entity: Option<Entity>,
    pub issued_at: Timestamp,
    pub status: MutationStatus,
    /// Pre-mutation state used for rollback (updates and deletes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Entity>,
    /// Fields written by an update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Map<String, Value>>,
    /// The user removed a speculative create before it was confirmed
    #[serde(default)]
    pub cancelled: bool,
    /// Id assigned by the remote store once a create is known to exist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_id: Option<EntityId>,
}

impl PendingMutation {
    pub(crate) fn create(local_id: LocalId, speculative: Entity, issued_at: Timestamp) -> Self {
        Self {
            local_id,
            kind: MutationKind::Create,
            target_id: None,
            speculative_entity: Some(speculative),
            issued_at,
            status: MutationStatus::InFlight,
            snapshot: None,
            patch: None,
            cancelled: false,
            confirmed_id: None,
        }
    }

    pub(crate) fn update(
        local_id: LocalId,
        snapshot: Entity,
        speculative: Entity,
        patch: Map<String, Value>,
        issued_at: Timestamp,
    ) -> Self {
        Self {
            local_id,
            kind: MutationKind::Update,
            target_id: Some(snapshot.id.clone()),
            speculative_entity: Some(speculative),
            issued_at,
            status: MutationStatus::InFlight,
            snapshot: Some(snapshot),
            patch: Some(patch),
            cancelled: false,
            confirmed_id: None,
        }
    }

    pub(crate) fn delete(local_id: LocalId, snapshot: Entity, issued_at: Timestamp) -> Self {
        Self {
            local_id,
            kind: MutationKind::Delete,
            target_id: Some(snapshot.id.clone()),
            speculative_entity: None,
            issued_at,
            status: MutationStatus::InFlight,
            snapshot: Some(snapshot),
            patch: None,
            cancelled: false,
            confirmed_id: None,
        }
    }

    pub(crate) fn toggle(intent: &ToggleIntent, speculative: Option<Entity>) -> Self {
        Self {
            local_id: intent.speculative_id.clone(),
            kind: MutationKind::Toggle,
            target_id: Some(intent.key.target_id.clone()),
            speculative_entity: speculative,
            issued_at: intent.issued_at,
            status: MutationStatus::InFlight,
            snapshot: intent.confirmed.clone(),
            patch: None,
            cancelled: false,
            confirmed_id: intent.confirmed.as_ref().map(|e| e.id.clone()),
        }
    }

    /// Check if the mutation still awaits its outcome.
    pub fn is_in_flight(&self) -> bool {
        self.status == MutationStatus::InFlight
    }

    /// Check if this mutation targets `id`.
    pub fn targets(&self, id: &str) -> bool {
        self.target_id.as_deref() == Some(id)
    }

    /// Revision the mutation was based on.
    pub fn base_revision(&self) -> Option<&Revision> {
        self.snapshot.as_ref().map(|s| &s.revision)
    }
}

/// The current user's intent for one marker of a join collection.
///
/// Toggles only record the desired end state; a single dispatcher per key
/// drives the remote store towards it, reading `desired` afresh before
/// every write.
#[derive(Debug, Clone, PartialEq)]
pub struct ToggleIntent {
    pub key: JoinKey,
    /// Flag the user asked for last
    pub desired: bool,
    /// Marker known to exist remotely
    pub confirmed: Option<Entity>,
    /// Id of the speculative marker shown while the create is pending
    pub speculative_id: LocalId,
    /// A dispatcher is running for this key
    pub dispatching: bool,
    pub issued_at: Timestamp,
}

impl ToggleIntent {
    /// Check if local intent and remote state agree.
    pub fn is_settled(&self) -> bool {
        self.desired == self.confirmed.is_some()
    }
}

/// Begin result of a toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToggleBegin {
    /// The mirror changed
    pub changed: bool,
    /// The caller must start a dispatcher for the key
    pub dispatch: bool,
}

/// What the toggle dispatcher must do next.
#[derive(Debug, Clone, PartialEq)]
pub enum ToggleStep {
    /// Write this marker
    Create(Entity),
    /// Remove the confirmed marker with this id
    Delete(EntityId),
    /// Remote state matches intent; the intent has been retired
    Settled { present: bool },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reason() -> Entity {
        Entity::new(
            "r-1",
            "reasons",
            json!({"text": "smile"}),
            "alice",
            1000,
            Revision::with_counter("remote", 4),
        )
    }

    #[test]
    fn update_records_snapshot_and_base() {
        let snapshot = reason();
        let patch = json!({"text": "laugh"}).as_object().unwrap().clone();
        let speculative = snapshot.patched(&patch).into_speculative();
        let pending = PendingMutation::update("local-1".into(), snapshot, speculative, patch, 9);

        assert!(pending.is_in_flight());
        assert!(pending.targets("r-1"));
        assert_eq!(pending.base_revision().unwrap().counter, 4);
        assert_eq!(pending.kind, MutationKind::Update);
    }

    #[test]
    fn create_has_no_target() {
        let pending = PendingMutation::create("local-2".into(), reason(), 9);
        assert!(pending.target_id.is_none());
        assert!(pending.base_revision().is_none());
    }

    #[test]
    fn status_serialization() {
        let json = serde_json::to_string(&MutationStatus::InFlight).unwrap();
        assert_eq!(json, r#""in-flight""#);
    }

    #[test]
    fn intent_settled_when_flag_matches_remote() {
        let mut intent = ToggleIntent {
            key: JoinKey::new("p-1", "alice"),
            desired: true,
            confirmed: None,
            speculative_id: "local-3".into(),
            dispatching: false,
            issued_at: 0,
        };
        assert!(!intent.is_settled());
        intent.confirmed = Some(reason());
        assert!(intent.is_settled());
    }
}
