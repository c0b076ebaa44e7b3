//! Entity types for synchronized records.

use crate::{CollectionKind, EntityId, LocalId, Revision, Timestamp, UserId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix of temporary client-local entity ids.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Whether an id is a temporary client-local id.
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// Origin of an entity's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Speculative local state, not yet confirmed by the remote store
    Local,
    /// Confirmed by a fetch, a change-feed event or a write response
    Remote,
}

/// Identity of a marker in a join collection: one marker per
/// `(target, user)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinKey {
    pub target_id: EntityId,
    pub user_id: UserId,
}

impl JoinKey {
    pub fn new(target_id: impl Into<EntityId>, user_id: impl Into<UserId>) -> Self {
        Self {
            target_id: target_id.into(),
            user_id: user_id.into(),
        }
    }
}

impl std::fmt::Display for JoinKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.target_id, self.user_id)
    }
}

/// A synchronized record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Unique identifier within the scope
    pub id: EntityId,
    /// Record type discriminator (the collection kind)
    pub kind: CollectionKind,
    /// The actual data payload (JSON object)
    pub payload: Value,
    /// User who authored the record
    pub author_id: UserId,
    /// Creation time (milliseconds since epoch)
    pub created_at: Timestamp,
    /// Revision marker of the last write
    pub revision: Revision,
    /// Client mutation id echoed back by the remote store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<LocalId>,
    /// Whether this state is speculative or confirmed
    #[serde(default = "remote_origin")]
    pub origin: Origin,
}

fn remote_origin() -> Origin {
    Origin::Remote
}

impl Entity {
    /// Create a confirmed entity.
    pub fn new(
        id: impl Into<EntityId>,
        kind: impl Into<CollectionKind>,
        payload: Value,
        author_id: impl Into<UserId>,
        created_at: Timestamp,
        revision: Revision,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            payload,
            author_id: author_id.into(),
            created_at,
            revision,
            correlation: None,
            origin: Origin::Remote,
        }
    }

    /// Create a speculative entity under a temporary local id.
    ///
    /// The local id doubles as the correlation token the remote store
    /// echoes back on the confirmed entity.
    pub fn speculative(
        local_id: impl Into<LocalId>,
        kind: impl Into<CollectionKind>,
        payload: Value,
        author_id: impl Into<UserId>,
        created_at: Timestamp,
        revision: Revision,
    ) -> Self {
        let local_id = local_id.into();
        Self {
            id: local_id.clone(),
            kind: kind.into(),
            payload,
            author_id: author_id.into(),
            created_at,
            revision,
            correlation: Some(local_id),
            origin: Origin::Local,
        }
    }

    /// Builder-style method to attach a correlation token.
    pub fn with_correlation(mut self, correlation: impl Into<LocalId>) -> Self {
        self.correlation = Some(correlation.into());
        self
    }

    /// Check if this entity is speculative.
    pub fn is_speculative(&self) -> bool {
        self.origin == Origin::Local
    }

    /// Look up a field by name.
    ///
    /// Payload fields shadow nothing: the pseudo-fields `id`, `authorId`
    /// and `createdAt` resolve to the entity's own attributes.
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.clone())),
            "authorId" => Some(Value::String(self.author_id.clone())),
            "createdAt" => Some(Value::from(self.created_at)),
            _ => self.payload.get(name).cloned(),
        }
    }

    /// The join key of this entity if `join_field` holds a string.
    pub fn join_key(&self, join_field: &str) -> Option<JoinKey> {
        self.payload
            .get(join_field)
            .and_then(Value::as_str)
            .map(|target| JoinKey::new(target, self.author_id.clone()))
    }

    /// Return a copy with `patch` shallow-merged into the payload.
    ///
    /// A `null` value in the patch removes the field.
    pub fn patched(&self, patch: &Map<String, Value>) -> Self {
        let mut next = self.clone();
        let mut payload = match next.payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in patch {
            if value.is_null() {
                payload.remove(key);
            } else {
                payload.insert(key.clone(), value.clone());
            }
        }
        next.payload = Value::Object(payload);
        next
    }

    /// Mark this entity as speculative local state.
    pub fn into_speculative(mut self) -> Self {
        self.origin = Origin::Local;
        self
    }

    /// Decode the payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> crate::error::Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| crate::Error::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn photo() -> Entity {
        Entity::new(
            "p-1",
            "photos",
            json!({"title": "Beach", "album": "summer"}),
            "alice",
            1000,
            Revision::with_counter("remote", 1),
        )
    }

    #[test]
    fn create_entity() {
        let entity = photo();
        assert_eq!(entity.id, "p-1");
        assert_eq!(entity.kind, "photos");
        assert_eq!(entity.origin, Origin::Remote);
        assert!(entity.correlation.is_none());
        assert!(!entity.is_speculative());
    }

    #[test]
    fn speculative_entity_correlates_to_local_id() {
        let entity = Entity::speculative(
            "local-1",
            "photos",
            json!({"title": "X"}),
            "alice",
            1000,
            Revision::new("client"),
        );
        assert!(entity.is_speculative());
        assert!(is_local_id(&entity.id));
        assert_eq!(entity.correlation.as_deref(), Some("local-1"));
    }

    #[test]
    fn field_lookup_resolves_pseudo_fields() {
        let entity = photo();
        assert_eq!(entity.field("title"), Some(json!("Beach")));
        assert_eq!(entity.field("authorId"), Some(json!("alice")));
        assert_eq!(entity.field("createdAt"), Some(json!(1000)));
        assert_eq!(entity.field("missing"), None);
    }

    #[test]
    fn patch_merges_and_removes() {
        let patch = json!({"title": "Sunset", "album": null, "rating": 5});
        let next = photo().patched(patch.as_object().unwrap());
        assert_eq!(next.payload, json!({"title": "Sunset", "rating": 5}));
        assert_eq!(next.revision, photo().revision);
    }

    #[test]
    fn join_key_requires_string_target() {
        let marker = Entity::new(
            "f-1",
            "favorites",
            json!({"photoId": "p-1"}),
            "alice",
            1000,
            Revision::with_counter("remote", 1),
        );
        assert_eq!(marker.join_key("photoId"), Some(JoinKey::new("p-1", "alice")));
        assert_eq!(marker.join_key("trackId"), None);
    }

    #[test]
    fn decode_typed_payload() {
        #[derive(Deserialize)]
        struct Photo {
            title: String,
        }
        let decoded: Photo = photo().decode().unwrap();
        assert_eq!(decoded.title, "Beach");

        let bad: crate::error::Result<u32> = photo().decode();
        assert!(matches!(bad, Err(crate::Error::Decode(_))));
    }

    #[test]
    fn origin_defaults_to_remote_when_absent() {
        let json = r#"{
            "id": "p-9", "kind": "photos", "payload": {}, "authorId": "bob",
            "createdAt": 5, "revision": {"writer": "remote", "counter": 2}
        }"#;
        let entity: Entity = serde_json::from_str(json).unwrap();
        assert_eq!(entity.origin, Origin::Remote);
    }
}
