//! LocalMirror - the ordered, keyed in-memory copy of one scope.
//!
//! The mirror is what the UI renders. Only the reconciliation engine
//! writes to it; everything else gets `&LocalMirror` or a snapshot.

use crate::{EntityId, Entity, JoinKey, MirrorRevision, Revision, Scope, SortOrder};
use std::cmp::Ordering;
use std::collections::HashMap;

/// An ordered map from entity id to entity.
#[derive(Debug, Clone)]
pub struct LocalMirror {
    scope: Scope,
    sort: SortOrder,
    entities: HashMap<EntityId, Entity>,
    /// Ids in sort order
    order: Vec<EntityId>,
    /// Revisions of entities removed by confirmed deletes
    tombstones: HashMap<EntityId, Revision>,
    /// Bumped on every effective change
    revision: MirrorRevision,
}

impl LocalMirror {
    /// Create an empty mirror for a scope.
    pub fn new(scope: Scope, sort: SortOrder) -> Self {
        Self {
            scope,
            sort,
            entities: HashMap::new(),
            order: Vec::new(),
            tombstones: HashMap::new(),
            revision: 0,
        }
    }

    /// Get the scope this mirror belongs to.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Get the sort order.
    pub fn sort(&self) -> &SortOrder {
        &self.sort
    }

    /// Get the mirror revision counter.
    pub fn revision(&self) -> MirrorRevision {
        self.revision
    }

    /// Get an entity by id.
    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    /// Check if an entity is present.
    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Check if the mirror has no entities.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterate entities in sort order.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.order.iter().filter_map(|id| self.entities.get(id))
    }

    /// Ids in sort order.
    pub fn ids(&self) -> &[EntityId] {
        &self.order
    }

    /// Clone the ordered contents.
    pub fn to_vec(&self) -> Vec<Entity> {
        self.iter().cloned().collect()
    }

    /// Find the marker for a join key in a join collection.
    pub fn marker_for(&self, join_field: &str, key: &JoinKey) -> Option<&Entity> {
        self.iter()
            .find(|e| e.join_key(join_field).as_ref() == Some(key))
    }

    /// The tombstone revision of a deleted entity.
    pub fn tombstone(&self, id: &str) -> Option<&Revision> {
        self.tombstones.get(id)
    }

    /// Query the mirror.
    pub fn query(&self) -> QueryBuilder<'_> {
        QueryBuilder::new(self)
    }

    /// Insert or replace an entity, keeping sort order.
    ///
    /// Returns false if the stored entity was already identical.
    pub(crate) fn upsert(&mut self, entity: Entity) -> bool {
        if self.entities.get(&entity.id) == Some(&entity) {
            return false;
        }
        if self.entities.contains_key(&entity.id) {
            self.unlink(&entity.id);
        }
        let position = self.order.partition_point(|id| {
            self.entities
                .get(id)
                .map(|other| self.sort.compare(other, &entity) == Ordering::Less)
                .unwrap_or(false)
        });
        self.order.insert(position, entity.id.clone());
        self.entities.insert(entity.id.clone(), entity);
        self.revision += 1;
        true
    }

    /// Remove an entity.
    pub(crate) fn remove(&mut self, id: &str) -> Option<Entity> {
        let removed = self.entities.remove(id)?;
        self.unlink(id);
        self.revision += 1;
        Some(removed)
    }

    /// Remember that an entity was deleted at `revision`.
    pub(crate) fn bury(&mut self, id: &str, revision: Revision) {
        let slot = self
            .tombstones
            .entry(id.to_string())
            .or_insert_with(|| revision.clone());
        if *slot < revision {
            *slot = revision;
        }
    }

    /// Drop all contents and tombstones.
    pub(crate) fn clear(&mut self) {
        let had_content = !self.order.is_empty();
        self.entities.clear();
        self.order.clear();
        self.tombstones.clear();
        if had_content {
            self.revision += 1;
        }
    }

    fn unlink(&mut self, id: &str) {
        if let Some(pos) = self.order.iter().position(|x| x == id) {
            self.order.remove(pos);
        }
    }
}

/// Builder for querying a mirror.
#[derive(Debug)]
pub struct QueryBuilder<'a> {
    mirror: &'a LocalMirror,
    confirmed_only: bool,
}

impl<'a> QueryBuilder<'a> {
    fn new(mirror: &'a LocalMirror) -> Self {
        Self {
            mirror,
            confirmed_only: false,
        }
    }

    /// Exclude speculative entities.
    pub fn confirmed_only(mut self) -> Self {
        self.confirmed_only = true;
        self
    }

    fn entities(&self) -> impl Iterator<Item = &'a Entity> + '_ {
        let confirmed_only = self.confirmed_only;
        self.mirror
            .iter()
            .filter(move |e| !confirmed_only || !e.is_speculative())
    }

    /// Get all matching entities in mirror order.
    pub fn all(self) -> Vec<&'a Entity> {
        self.entities().collect()
    }

    /// Get the first matching entity.
    pub fn first(self) -> Option<&'a Entity> {
        self.entities().next()
    }

    /// Count matching entities.
    pub fn count(self) -> usize {
        self.entities().count()
    }

    /// Filter entities by a predicate.
    pub fn filter<F>(self, predicate: F) -> Vec<&'a Entity>
    where
        F: Fn(&Entity) -> bool,
    {
        self.entities().filter(|e| predicate(e)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn photo(id: &str, created_at: u64) -> Entity {
        Entity::new(
            id,
            "photos",
            json!({"title": id}),
            "alice",
            created_at,
            Revision::with_counter("remote", 1),
        )
    }

    fn mirror() -> LocalMirror {
        LocalMirror::new(Scope::new("home", "photos"), SortOrder::default())
    }

    #[test]
    fn keeps_newest_first() {
        let mut mirror = mirror();
        mirror.upsert(photo("b", 2000));
        mirror.upsert(photo("a", 1000));
        mirror.upsert(photo("c", 3000));

        assert_eq!(mirror.ids(), &["c", "b", "a"]);
        assert_eq!(mirror.len(), 3);
    }

    #[test]
    fn upsert_repositions_and_counts_revisions() {
        let mut mirror = mirror();
        assert!(mirror.upsert(photo("a", 1000)));
        assert!(mirror.upsert(photo("b", 2000)));
        assert_eq!(mirror.revision(), 2);

        assert!(!mirror.upsert(photo("a", 1000)));
        assert_eq!(mirror.revision(), 2);

        assert!(mirror.upsert(photo("a", 5000)));
        assert_eq!(mirror.ids(), &["a", "b"]);
        assert_eq!(mirror.revision(), 3);
    }

    #[test]
    fn remove_absent_is_none() {
        let mut mirror = mirror();
        mirror.upsert(photo("a", 1000));
        assert!(mirror.remove("a").is_some());
        assert!(mirror.remove("a").is_none());
        assert!(mirror.is_empty());
        assert_eq!(mirror.revision(), 2);
    }

    #[test]
    fn tombstones_keep_highest_revision() {
        let mut mirror = mirror();
        mirror.bury("a", Revision::with_counter("remote", 3));
        mirror.bury("a", Revision::with_counter("remote", 2));
        assert_eq!(mirror.tombstone("a").unwrap().counter, 3);

        mirror.clear();
        assert!(mirror.tombstone("a").is_none());
    }

    #[test]
    fn query_excludes_speculative_on_request() {
        let mut mirror = mirror();
        mirror.upsert(photo("a", 1000));
        mirror.upsert(photo("local-1", 2000).into_speculative());

        assert_eq!(mirror.query().count(), 2);
        assert_eq!(mirror.query().confirmed_only().count(), 1);
        assert_eq!(mirror.query().first().unwrap().id, "local-1");
        assert_eq!(mirror.query().filter(|e| e.created_at < 1500).len(), 1);
    }
}
