//! Reconciliation of remote events and optimistic writes.
//!
//! The [`ReconciliationEngine`] is the only writer of a [`LocalMirror`].
//! Change-feed events, fetch results and the outcomes of optimistic
//! mutations all flow through it, and every merge is idempotent: applying
//! the same input twice leaves the mirror as applying it once did.
//!
//! # Rules
//!
//! 1. Last writer wins by revision, never by arrival order
//! 2. An incoming entity with the same revision as a speculative one does
//!    not displace it (it is the pre-mutation state)
//! 3. Confirmed deletes leave tombstones; stale inserts cannot revive them
//! 4. An event matching an in-flight mutation confirms it; the event's
//!    entity replaces the speculative one in the same logical row
//! 5. Fetch results are authoritative; in-flight speculation is re-applied

use crate::{
    error::Result, is_local_id, ChangeEvent, CollectionSchema, Entity, EntityId, Error, JoinKey,
    LocalId, LocalMirror, MutationKind, Origin, PendingMutation, Revision, Scope, Timestamp,
    ToggleBegin, ToggleIntent, ToggleStep, UserId,
};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Outcome of a single merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    Inserted,
    Updated,
    Removed,
    /// The event resolved a pending mutation or a toggle intent
    Confirmed,
    /// Identical state was already present
    Unchanged,
    /// Older than the stored revision or a tombstone
    Stale,
    /// Delete of an entity that is not present
    Absent,
    /// Entity does not belong to this scope
    OutOfScope,
    /// Held back because a local mutation owns the row
    Suppressed,
}

impl Merge {
    /// Whether the merge may have changed what the mirror shows.
    pub fn changed(&self) -> bool {
        matches!(
            self,
            Merge::Inserted | Merge::Updated | Merge::Removed | Merge::Confirmed
        )
    }
}

/// How a pending mutation was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Confirmed,
    RolledBack,
    /// A change-feed event or resync resolved it first
    AlreadyResolved,
    /// Cancelled locally before anything was committed
    Cancelled,
    /// Cancelled locally, but the remote store committed it under this id;
    /// the caller must delete it remotely
    CancelledAfterCommit(EntityId),
}

/// Result of starting a delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteBegin {
    /// The entity was removed and a pending delete recorded
    Removed,
    /// The target was a speculative create; it was cancelled instead
    CancelledCreate,
}

/// Summary of an authoritative resync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResyncSummary {
    /// Entities taken from the fetch result
    pub fetched: usize,
    /// Previously confirmed entities the fetch no longer contains
    pub dropped: usize,
    /// Pending mutations still in flight
    pub pending: usize,
}

/// Sole writer of one scope's mirror.
#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    schema: CollectionSchema,
    user_id: UserId,
    mirror: LocalMirror,
    /// Pending mutations in issue order
    pending: Vec<PendingMutation>,
    toggles: HashMap<JoinKey, ToggleIntent>,
}

impl ReconciliationEngine {
    /// Create an engine with an empty mirror.
    pub fn new(scope: Scope, schema: CollectionSchema, user_id: impl Into<UserId>) -> Self {
        let mirror = LocalMirror::new(scope, schema.sort.clone());
        Self {
            schema,
            user_id: user_id.into(),
            mirror,
            pending: Vec::new(),
            toggles: HashMap::new(),
        }
    }

    /// Get the mirror (read-only).
    pub fn mirror(&self) -> &LocalMirror {
        &self.mirror
    }

    /// Get the scope.
    pub fn scope(&self) -> &Scope {
        self.mirror.scope()
    }

    /// Get the collection schema.
    pub fn schema(&self) -> &CollectionSchema {
        &self.schema
    }

    /// Get the user that authors local mutations.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// All unresolved mutations, toggles included.
    pub fn pending(&self) -> Vec<PendingMutation> {
        let mut list = self.pending.clone();
        let mut toggles: Vec<&ToggleIntent> = self.toggles.values().collect();
        toggles.sort_by(|a, b| a.key.cmp(&b.key));
        list.extend(toggles.into_iter().map(|intent| {
            let speculative = intent
                .desired
                .then(|| self.speculative_marker(intent))
                .flatten();
            PendingMutation::toggle(intent, speculative)
        }));
        list
    }

    /// Number of unresolved mutations.
    pub fn pending_count(&self) -> usize {
        self.pending.iter().filter(|p| p.is_in_flight()).count() + self.toggles.len()
    }

    /// Look up a pending mutation by local id.
    pub fn pending_for(&self, local_id: &str) -> Option<&PendingMutation> {
        self.pending.iter().find(|p| p.local_id == local_id)
    }

    /// Get the toggle intent for a target, if one is unsettled.
    pub fn toggle_intent(&self, target_id: &str) -> Option<&ToggleIntent> {
        self.toggles.get(&self.join_key(target_id))
    }

    /// Whether the current user's marker on `target_id` is shown.
    pub fn flag(&self, target_id: &str) -> bool {
        match &self.schema.join_field {
            Some(field) => self
                .mirror
                .marker_for(field, &self.join_key(target_id))
                .is_some(),
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Merge operations
    // ------------------------------------------------------------------

    /// Insert an entity; an existing id is treated as an update.
    pub fn apply_insert(&mut self, entity: Entity) -> Merge {
        self.merge(entity)
    }

    /// Replace an entity unless the stored revision is newer; an absent id
    /// is treated as an insert.
    pub fn apply_update(&mut self, entity: Entity) -> Merge {
        self.merge(entity)
    }

    /// Remove an entity; absent ids are a silent no-op.
    pub fn apply_delete(&mut self, id: &str) -> Merge {
        self.remove_confirmed(id, None)
    }

    /// Apply a change-feed event, resolving any mutation it confirms.
    pub fn apply_event(&mut self, event: ChangeEvent) -> Merge {
        match event {
            ChangeEvent::Insert(entity) | ChangeEvent::Update(entity) => self.accept(entity),
            ChangeEvent::Delete(entity) => self.accept_delete(entity),
        }
    }

    /// Replace the mirror with an authoritative fetch result.
    ///
    /// Confirmed entities missing from `entities` are dropped. In-flight
    /// creates, updates and deletes are re-applied on top so the user's
    /// speculation survives the resync.
    pub fn replace_all(&mut self, entities: Vec<Entity>) -> ResyncSummary {
        let previous: HashSet<EntityId> = self
            .mirror
            .iter()
            .filter(|e| !e.is_speculative())
            .map(|e| e.id.clone())
            .collect();

        self.mirror.clear();
        let mut summary = ResyncSummary::default();
        for mut entity in entities {
            if !self.mirror.scope().matches(&entity) {
                continue;
            }
            entity.origin = Origin::Remote;
            self.mirror.upsert(entity);
            summary.fetched += 1;
        }
        summary.dropped = previous
            .iter()
            .filter(|id| !self.mirror.contains(id))
            .count();

        let mut kept = Vec::new();
        let mut rebase_targets = Vec::new();
        for mut pending in std::mem::take(&mut self.pending) {
            let committed = self
                .mirror
                .iter()
                .find(|e| e.correlation.as_deref() == Some(pending.local_id.as_str()))
                .map(|e| e.id.clone());

            match pending.kind {
                MutationKind::Create if pending.cancelled => {
                    if let Some(id) = committed {
                        self.mirror.remove(&id);
                        pending.confirmed_id = Some(id);
                    }
                    kept.push(pending);
                }
                MutationKind::Create => {
                    if committed.is_some() || !pending.is_in_flight() {
                        continue;
                    }
                    if let Some(speculative) = pending.speculative_entity.clone() {
                        if self.mirror.scope().matches(&speculative) {
                            self.mirror.upsert(speculative);
                        }
                    }
                    kept.push(pending);
                }
                MutationKind::Update => {
                    let Some(target) = pending.target_id.clone() else {
                        continue;
                    };
                    if self.mirror.contains(&target) && pending.is_in_flight() {
                        rebase_targets.push(target);
                        kept.push(pending);
                    }
                }
                MutationKind::Delete => {
                    let Some(target) = pending.target_id.clone() else {
                        continue;
                    };
                    if let Some(current) = self.mirror.remove(&target) {
                        pending.snapshot = Some(current);
                        kept.push(pending);
                    }
                }
                MutationKind::Toggle => {}
            }
        }
        self.pending = kept;

        for target in rebase_targets {
            self.rebase(&target);
        }

        if let Some(join_field) = self.schema.join_field.clone() {
            let keys: Vec<JoinKey> = self.toggles.keys().cloned().collect();
            for key in keys {
                let confirmed = self
                    .mirror
                    .iter()
                    .find(|e| !e.is_speculative() && e.join_key(&join_field).as_ref() == Some(&key))
                    .cloned();
                if let Some(intent) = self.toggles.get_mut(&key) {
                    intent.confirmed = confirmed;
                }
                self.reflect_toggle(&key);
            }
        }

        summary.pending = self.pending_count();
        summary
    }

    // ------------------------------------------------------------------
    // Optimistic mutations
    // ------------------------------------------------------------------

    /// Insert a speculative entity for a create.
    pub fn begin_create(
        &mut self,
        local_id: LocalId,
        payload: Value,
        now: Timestamp,
    ) -> Result<Entity> {
        self.schema.validate_payload(&payload)?;
        let speculative = Entity::speculative(
            local_id.clone(),
            self.schema.kind.clone(),
            payload,
            self.user_id.clone(),
            now,
            Revision::new(self.user_id.clone()),
        );
        self.pending
            .push(PendingMutation::create(local_id, speculative.clone(), now));
        self.apply_insert(speculative.clone());
        Ok(speculative)
    }

    /// Patch an entity speculatively, remembering the pre-mutation state.
    pub fn begin_update(
        &mut self,
        local_id: LocalId,
        id: &str,
        patch: Map<String, Value>,
        now: Timestamp,
    ) -> Result<Entity> {
        if is_local_id(id) {
            return Err(Error::StillPending(id.to_string()));
        }
        self.schema.validate_patch(&patch)?;
        if let Some(join_field) = &self.schema.join_field {
            if patch.contains_key(join_field) {
                return Err(Error::InvalidPayload(format!(
                    "join field '{join_field}' cannot be patched"
                )));
            }
        }
        let current = self
            .mirror
            .get(id)
            .cloned()
            .ok_or_else(|| Error::EntityNotFound(id.to_string()))?;

        let speculative = current.patched(&patch).into_speculative();
        self.pending.push(PendingMutation::update(
            local_id,
            current,
            speculative.clone(),
            patch,
            now,
        ));
        self.apply_update(speculative.clone());
        Ok(speculative)
    }

    /// Remove an entity speculatively, remembering it for rollback.
    ///
    /// Deleting a speculative create cancels the create instead.
    pub fn begin_delete(
        &mut self,
        local_id: LocalId,
        id: &str,
        now: Timestamp,
    ) -> Result<DeleteBegin> {
        if let Some(create) = self
            .pending
            .iter_mut()
            .find(|p| p.kind == MutationKind::Create && p.local_id == id && !p.cancelled)
        {
            create.cancelled = true;
            self.mirror.remove(id);
            return Ok(DeleteBegin::CancelledCreate);
        }

        let current = self
            .mirror
            .get(id)
            .cloned()
            .ok_or_else(|| Error::EntityNotFound(id.to_string()))?;
        // Removed directly: apply_delete would treat the new pending
        // delete as confirmed.
        self.mirror.remove(id);
        self.pending
            .push(PendingMutation::delete(local_id, current, now));
        Ok(DeleteBegin::Removed)
    }

    /// Resolve a pending mutation with the remote store's answer.
    ///
    /// A mutation that is no longer pending is left alone; the caller
    /// decides whether the answer still applies as a change event.
    pub fn confirm(&mut self, local_id: &str, entity: Option<Entity>) -> Resolution {
        let Some(idx) = self.pending_index(local_id) else {
            return Resolution::AlreadyResolved;
        };
        let pending = self.pending.remove(idx);
        let entity = entity.map(|mut e| {
            e.origin = Origin::Remote;
            e
        });

        match pending.kind {
            MutationKind::Create => {
                if pending.cancelled {
                    let committed = entity
                        .as_ref()
                        .map(|e| e.id.clone())
                        .or(pending.confirmed_id);
                    if let Some(e) = &entity {
                        self.mirror.bury(&e.id, e.revision.clone());
                    }
                    return match committed {
                        Some(id) => Resolution::CancelledAfterCommit(id),
                        None => Resolution::Cancelled,
                    };
                }
                self.mirror.remove(&pending.local_id);
                if let Some(entity) = entity {
                    self.settle(entity);
                }
            }
            MutationKind::Update => match (entity, pending.target_id) {
                (Some(entity), _) => self.settle(entity),
                (None, Some(target)) => self.promote(&target),
                (None, None) => {}
            },
            MutationKind::Delete => {
                if let Some(gone) = entity.or(pending.snapshot) {
                    self.mirror.bury(&gone.id, gone.revision);
                    self.mirror.remove(&gone.id);
                }
            }
            MutationKind::Toggle => {}
        }
        Resolution::Confirmed
    }

    /// Roll back a pending mutation after a terminal failure.
    pub fn fail(&mut self, local_id: &str) -> Resolution {
        let Some(idx) = self.pending_index(local_id) else {
            return Resolution::AlreadyResolved;
        };
        let pending = self.pending.remove(idx);

        match pending.kind {
            MutationKind::Create => {
                if pending.cancelled {
                    return match pending.confirmed_id {
                        Some(id) => Resolution::CancelledAfterCommit(id),
                        None => Resolution::Cancelled,
                    };
                }
                self.mirror.remove(&pending.local_id);
            }
            MutationKind::Update => self.rollback_update(&pending),
            MutationKind::Delete => {
                if let Some(snapshot) = pending.snapshot {
                    if !self.mirror.contains(&snapshot.id) && !self.is_buried(&snapshot) {
                        self.mirror.upsert(snapshot);
                    }
                }
            }
            MutationKind::Toggle => {}
        }
        Resolution::RolledBack
    }

    // ------------------------------------------------------------------
    // Toggles
    // ------------------------------------------------------------------

    /// Record the user's desired flag for `target_id` and show it.
    pub fn begin_toggle(
        &mut self,
        target_id: &str,
        flag: bool,
        local_id: LocalId,
        now: Timestamp,
    ) -> Result<ToggleBegin> {
        let join_field = self
            .schema
            .join_field
            .clone()
            .ok_or_else(|| Error::NotToggleable(self.schema.kind.clone()))?;
        if target_id.is_empty() {
            return Err(Error::InvalidPayload("target id must not be empty".into()));
        }
        let key = self.join_key(target_id);

        if let Some(intent) = self.toggles.get_mut(&key) {
            intent.desired = flag;
        } else {
            let shown = self.mirror.marker_for(&join_field, &key);
            if shown.is_some() == flag {
                return Ok(ToggleBegin {
                    changed: false,
                    dispatch: false,
                });
            }
            let confirmed = shown.filter(|e| !e.is_speculative()).cloned();
            self.toggles.insert(
                key.clone(),
                ToggleIntent {
                    key: key.clone(),
                    desired: flag,
                    confirmed,
                    speculative_id: local_id,
                    dispatching: false,
                    issued_at: now,
                },
            );
        }

        let before = self.mirror.revision();
        self.reflect_toggle(&key);
        let changed = self.mirror.revision() != before;

        let mut dispatch = false;
        let mut retire = false;
        if let Some(intent) = self.toggles.get_mut(&key) {
            if !intent.dispatching {
                if intent.is_settled() {
                    retire = true;
                } else {
                    intent.dispatching = true;
                    dispatch = true;
                }
            }
        }
        if retire {
            self.toggles.remove(&key);
        }
        Ok(ToggleBegin { changed, dispatch })
    }

    /// Decide the dispatcher's next write for `target_id`.
    ///
    /// Reads the intent as it is now, so any number of toggles queued
    /// while a write was in flight collapse into one decision.
    pub fn next_toggle_step(&mut self, target_id: &str) -> ToggleStep {
        let key = self.join_key(target_id);
        let Some(intent) = self.toggles.get(&key) else {
            return ToggleStep::Settled {
                present: self.flag(target_id),
            };
        };

        let settled = intent.is_settled();
        let desired = intent.desired;
        let confirmed_id = intent.confirmed.as_ref().map(|c| c.id.clone());
        let draft = self.speculative_marker(intent);

        match (settled, confirmed_id, draft) {
            (true, _, _) => {
                self.toggles.remove(&key);
                ToggleStep::Settled { present: desired }
            }
            (false, Some(id), _) if !desired => ToggleStep::Delete(id),
            (false, _, Some(draft)) => ToggleStep::Create(draft),
            (false, _, None) => {
                self.toggles.remove(&key);
                ToggleStep::Settled { present: false }
            }
        }
    }

    /// Record the remote marker state after a dispatcher write.
    pub fn toggle_resolved(&mut self, target_id: &str, marker: Option<Entity>) {
        let key = self.join_key(target_id);
        if let Some(intent) = self.toggles.get_mut(&key) {
            intent.confirmed = marker.map(|mut m| {
                m.origin = Origin::Remote;
                m
            });
        }
        self.reflect_toggle(&key);
    }

    /// Abandon the intent for `target_id` after a terminal failure.
    ///
    /// Returns the flag the mirror shows afterwards.
    pub fn toggle_failed(&mut self, target_id: &str) -> bool {
        let key = self.join_key(target_id);
        if let Some(intent) = self.toggles.get_mut(&key) {
            intent.desired = intent.confirmed.is_some();
        }
        self.reflect_toggle(&key);
        self.toggles.remove(&key);
        self.flag(target_id)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn join_key(&self, target_id: &str) -> JoinKey {
        JoinKey::new(target_id, self.user_id.clone())
    }

    fn pending_index(&self, local_id: &str) -> Option<usize> {
        self.pending.iter().position(|p| p.local_id == local_id)
    }

    fn is_buried(&self, entity: &Entity) -> bool {
        self.mirror
            .tombstone(&entity.id)
            .is_some_and(|tomb| !tomb.is_older_than(&entity.revision))
    }

    fn pending_delete_mut(&mut self, id: &str) -> Option<&mut PendingMutation> {
        self.pending
            .iter_mut()
            .find(|p| p.is_in_flight() && p.kind == MutationKind::Delete && p.targets(id))
    }

    /// Give `entity` to an in-flight delete of its row instead of showing
    /// it. A failed delete restores the newest state it was handed.
    fn hand_to_delete(&mut self, entity: &Entity) -> bool {
        let Some(delete) = self.pending_delete_mut(&entity.id) else {
            return false;
        };
        let newer = delete
            .snapshot
            .as_ref()
            .map_or(true, |s| !entity.revision.is_older_than(&s.revision));
        if newer {
            delete.snapshot = Some(entity.clone());
        }
        true
    }

    /// Core merge: last writer wins by revision.
    fn merge(&mut self, entity: Entity) -> Merge {
        if entity.kind != self.schema.kind {
            return Merge::OutOfScope;
        }
        if self.is_buried(&entity) {
            return Merge::Stale;
        }
        if self.hand_to_delete(&entity) {
            return Merge::Suppressed;
        }

        match self.mirror.get(&entity.id) {
            Some(current) if entity.revision.is_older_than(&current.revision) => {
                return Merge::Stale;
            }
            Some(current)
                if current.is_speculative()
                    && !entity.is_speculative()
                    && entity.revision == current.revision =>
            {
                return Merge::Unchanged;
            }
            _ => {}
        }

        if !self.mirror.scope().matches(&entity) {
            return match self.mirror.remove(&entity.id) {
                Some(_) => Merge::Removed,
                None => Merge::OutOfScope,
            };
        }

        let existed = self.mirror.contains(&entity.id);
        match (self.mirror.upsert(entity), existed) {
            (false, _) => Merge::Unchanged,
            (true, true) => Merge::Updated,
            (true, false) => Merge::Inserted,
        }
    }

    /// Accept a confirmed entity from the change feed.
    fn accept(&mut self, mut entity: Entity) -> Merge {
        entity.origin = Origin::Remote;
        if entity.kind != self.schema.kind {
            return Merge::OutOfScope;
        }

        if let Some(correlation) = entity.correlation.clone() {
            if let Some(idx) = self.pending_index(&correlation) {
                if let Some(merge) = self.confirm_by_event(idx, entity.clone()) {
                    return merge;
                }
            }
        }

        if let Some(join_field) = self.schema.join_field.clone() {
            if let Some(key) = entity.join_key(&join_field) {
                if self.toggles.contains_key(&key) {
                    return self.accept_marker(key, entity);
                }
            }
        }

        let confirms_update = self.pending.iter().position(|p| {
            p.is_in_flight()
                && p.kind == MutationKind::Update
                && p.targets(&entity.id)
                && p.base_revision().is_some_and(|base| base < &entity.revision)
        });
        if let Some(idx) = confirms_update {
            if let Some(merge) = self.confirm_by_event(idx, entity.clone()) {
                return merge;
            }
        }

        self.merge(entity)
    }

    /// Resolve the pending mutation at `idx` with an event entity.
    ///
    /// Returns `None` if the event does not fit the mutation's kind.
    fn confirm_by_event(&mut self, idx: usize, entity: Entity) -> Option<Merge> {
        let pending = &mut self.pending[idx];
        match pending.kind {
            MutationKind::Create if pending.cancelled => {
                pending.confirmed_id = Some(entity.id.clone());
                pending.status = crate::MutationStatus::Confirmed;
                self.mirror.bury(&entity.id, entity.revision);
                Some(Merge::Suppressed)
            }
            MutationKind::Create => {
                let local_id = pending.local_id.clone();
                self.pending.remove(idx);
                self.mirror.remove(&local_id);
                self.settle(entity);
                Some(Merge::Confirmed)
            }
            MutationKind::Update => {
                self.pending.remove(idx);
                self.settle(entity);
                Some(Merge::Confirmed)
            }
            MutationKind::Delete | MutationKind::Toggle => None,
        }
    }

    fn accept_delete(&mut self, mut entity: Entity) -> Merge {
        entity.origin = Origin::Remote;
        if entity.kind != self.schema.kind {
            return Merge::OutOfScope;
        }

        if let Some(join_field) = self.schema.join_field.clone() {
            if let Some(key) = entity.join_key(&join_field) {
                if let Some(intent) = self.toggles.get_mut(&key) {
                    if intent.confirmed.as_ref().map(|c| &c.id) == Some(&entity.id) {
                        intent.confirmed = None;
                    }
                    self.mirror.bury(&entity.id, entity.revision.clone());
                    self.reflect_toggle(&key);
                    return Merge::Confirmed;
                }
            }
        }

        self.remove_confirmed(&entity.id, Some(entity.revision))
    }

    fn remove_confirmed(&mut self, id: &str, revision: Option<Revision>) -> Merge {
        let mut resolved = false;
        if let Some(idx) = self.pending.iter().position(|p| {
            p.is_in_flight() && p.kind == MutationKind::Delete && p.targets(id)
        }) {
            self.pending.remove(idx);
            resolved = true;
        }
        // Updates of a deleted entity have nothing left to roll back to.
        self.pending
            .retain(|p| !(p.kind == MutationKind::Update && p.targets(id)));

        if let Some(revision) = revision {
            self.mirror.bury(id, revision);
        }
        match (self.mirror.remove(id), resolved) {
            (Some(_), _) => Merge::Removed,
            (None, true) => Merge::Confirmed,
            (None, false) => Merge::Absent,
        }
    }

    /// Install a confirmed entity as the truth for its row, then rebase
    /// any still-in-flight updates on top of it.
    fn settle(&mut self, entity: Entity) {
        let id = entity.id.clone();
        if self.is_buried(&entity) || self.hand_to_delete(&entity) {
            return;
        }
        // A row this session deleted stays deleted.
        if !self.mirror.contains(&id) && self.mirror.tombstone(&id).is_some() {
            return;
        }
        let keep_current = self
            .mirror
            .get(&id)
            .is_some_and(|current| {
                !current.is_speculative() && entity.revision.is_older_than(&current.revision)
            });
        if !keep_current {
            if self.mirror.scope().matches(&entity) {
                self.mirror.upsert(entity);
            } else {
                self.mirror.remove(&id);
            }
        }
        self.rebase(&id);
    }

    fn rebase(&mut self, id: &str) {
        let Some(mut current) = self
            .mirror
            .get(id)
            .filter(|e| !e.is_speculative())
            .cloned()
        else {
            return;
        };

        let mut touched = false;
        for pending in self
            .pending
            .iter_mut()
            .filter(|p| p.is_in_flight() && p.kind == MutationKind::Update && p.targets(id))
        {
            let Some(patch) = &pending.patch else {
                continue;
            };
            pending.snapshot = Some(current.clone());
            current = current.patched(patch).into_speculative();
            pending.speculative_entity = Some(current.clone());
            touched = true;
        }
        if touched {
            self.mirror.upsert(current);
        }
    }

    /// Mark the current state of `id` as confirmed when nothing else is
    /// in flight for it.
    fn promote(&mut self, id: &str) {
        let busy = self
            .pending
            .iter()
            .any(|p| p.is_in_flight() && p.targets(id));
        if busy {
            return;
        }
        if let Some(current) = self.mirror.get(id).cloned() {
            let mut confirmed = current;
            confirmed.origin = Origin::Remote;
            self.mirror.upsert(confirmed);
        }
    }

    /// Restore the fields a failed update wrote, leaving fields that a
    /// later edit has since changed alone.
    fn rollback_update(&mut self, pending: &PendingMutation) {
        let (Some(target), Some(snapshot), Some(patch)) =
            (&pending.target_id, &pending.snapshot, &pending.patch)
        else {
            return;
        };
        let others = self
            .pending
            .iter()
            .any(|p| p.is_in_flight() && p.kind == MutationKind::Update && p.targets(target));

        // The row is hidden by an in-flight delete: unwind the delete's copy.
        if let Some(delete) = self.pending_delete_mut(target) {
            if let Some(shown) = delete.snapshot.take() {
                delete.snapshot = Some(unwind(shown, snapshot, patch, others));
            }
            return;
        }

        let Some(current) = self.mirror.get(target).cloned() else {
            if !others && !self.is_buried(snapshot) && self.mirror.scope().matches(snapshot) {
                self.mirror.upsert(snapshot.clone());
            }
            return;
        };
        self.mirror.upsert(unwind(current, snapshot, patch, others));
    }

    /// Make the mirror show the intent for `key`.
    fn reflect_toggle(&mut self, key: &JoinKey) {
        let Some(join_field) = self.schema.join_field.clone() else {
            return;
        };
        let Some(intent) = self.toggles.get(key).cloned() else {
            return;
        };
        let shown = self.mirror.marker_for(&join_field, key).cloned();

        if !intent.desired {
            if let Some(shown) = shown {
                self.mirror.remove(&shown.id);
            }
            return;
        }
        match (intent.confirmed.clone(), shown) {
            (Some(confirmed), shown) => {
                if let Some(shown) = shown.filter(|s| s.id != confirmed.id) {
                    self.mirror.remove(&shown.id);
                }
                self.mirror.upsert(confirmed);
            }
            (None, Some(shown)) if shown.is_speculative() => {}
            (None, shown) => {
                if let Some(shown) = shown {
                    self.mirror.remove(&shown.id);
                }
                if let Some(marker) = self.speculative_marker(&intent) {
                    self.mirror.upsert(marker);
                }
            }
        }
    }

    fn accept_marker(&mut self, key: JoinKey, entity: Entity) -> Merge {
        if self.is_buried(&entity) {
            return Merge::Stale;
        }
        if let Some(intent) = self.toggles.get_mut(&key) {
            let newer = intent
                .confirmed
                .as_ref()
                .map_or(true, |c| c.id != entity.id || !entity.revision.is_older_than(&c.revision));
            if newer {
                intent.confirmed = Some(entity);
            }
        }
        self.reflect_toggle(&key);
        Merge::Confirmed
    }

    fn speculative_marker(&self, intent: &ToggleIntent) -> Option<Entity> {
        let join_field = self.schema.join_field.as_ref()?;
        let mut payload = Map::new();
        payload.insert(
            join_field.clone(),
            Value::String(intent.key.target_id.clone()),
        );
        Some(Entity::speculative(
            intent.speculative_id.clone(),
            self.schema.kind.clone(),
            Value::Object(payload),
            self.user_id.clone(),
            intent.issued_at,
            Revision::new(self.user_id.clone()),
        ))
    }
}

/// Undo the fields `patch` wrote to `current`, restoring their values
/// from `snapshot`. Fields changed since the patch was applied are kept.
fn unwind(current: Entity, snapshot: &Entity, patch: &Map<String, Value>, others: bool) -> Entity {
    let mut payload = current.payload.as_object().cloned().unwrap_or_default();
    let before = snapshot.payload.as_object();
    for (field, written) in patch {
        let shown = payload.get(field);
        let ours = if written.is_null() {
            shown.is_none()
        } else {
            shown == Some(written)
        };
        if !ours {
            continue;
        }
        match before.and_then(|b| b.get(field)) {
            Some(old) => {
                payload.insert(field.clone(), old.clone());
            }
            None => {
                payload.remove(field);
            }
        }
    }

    let mut restored = current;
    restored.payload = Value::Object(payload);
    if !others && restored.payload == snapshot.payload && restored.revision == snapshot.revision {
        return snapshot.clone();
    }
    restored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldType};
    use serde_json::json;

    fn photos() -> CollectionSchema {
        CollectionSchema::new(
            "photos",
            vec![
                FieldDef::required("title", FieldType::String),
                FieldDef::optional("album", FieldType::String),
                FieldDef::optional("rating", FieldType::Int),
            ],
        )
    }

    fn engine() -> ReconciliationEngine {
        ReconciliationEngine::new(Scope::new("home", "photos"), photos(), "alice")
    }

    fn favorites() -> ReconciliationEngine {
        ReconciliationEngine::new(
            Scope::new("home", "favorites"),
            CollectionSchema::new("favorites", vec![]).joined_on("photoId"),
            "alice",
        )
    }

    fn photo(id: &str, counter: u64, title: &str) -> Entity {
        Entity::new(
            id,
            "photos",
            json!({"title": title}),
            "bob",
            1000 + counter,
            Revision::with_counter("remote", counter),
        )
    }

    fn marker(id: &str, target: &str, counter: u64) -> Entity {
        Entity::new(
            id,
            "favorites",
            json!({"photoId": target}),
            "alice",
            1000,
            Revision::with_counter("remote", counter),
        )
    }

    fn patch(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn insert_then_duplicate_insert() {
        let mut engine = engine();
        assert_eq!(engine.apply_insert(photo("p-1", 1, "A")), Merge::Inserted);
        assert_eq!(engine.apply_insert(photo("p-1", 1, "A")), Merge::Unchanged);
        assert_eq!(engine.mirror().len(), 1);
    }

    #[test]
    fn insert_of_present_id_acts_as_update() {
        let mut engine = engine();
        engine.apply_insert(photo("p-1", 1, "A"));
        assert_eq!(engine.apply_insert(photo("p-1", 2, "B")), Merge::Updated);
        assert_eq!(engine.mirror().get("p-1").unwrap().payload["title"], "B");
    }

    #[test]
    fn update_of_absent_id_acts_as_insert() {
        let mut engine = engine();
        assert_eq!(engine.apply_update(photo("p-1", 3, "A")), Merge::Inserted);
    }

    #[test]
    fn stale_update_is_rejected() {
        let mut engine = engine();
        engine.apply_insert(photo("p-1", 5, "new"));
        let before = engine.mirror().revision();

        assert_eq!(engine.apply_update(photo("p-1", 4, "old")), Merge::Stale);
        assert_eq!(engine.mirror().get("p-1").unwrap().payload["title"], "new");
        assert_eq!(engine.mirror().revision(), before);
    }

    #[test]
    fn delete_absent_is_silent() {
        let mut engine = engine();
        assert_eq!(engine.apply_delete("ghost"), Merge::Absent);
        assert_eq!(engine.mirror().revision(), 0);
    }

    #[test]
    fn tombstone_blocks_replayed_insert() {
        let mut engine = engine();
        engine.apply_event(ChangeEvent::Insert(photo("p-1", 1, "A")));
        engine.apply_event(ChangeEvent::Delete(photo("p-1", 1, "A")));
        assert_eq!(
            engine.apply_event(ChangeEvent::Insert(photo("p-1", 1, "A"))),
            Merge::Stale
        );
        assert!(engine.mirror().is_empty());
    }

    #[test]
    fn update_leaving_filter_removes_entity() {
        let scope = Scope::new("home", "photos").with_filter("album", json!("summer"));
        let mut engine = ReconciliationEngine::new(scope, photos(), "alice");

        let mut p = photo("p-1", 1, "A");
        p.payload["album"] = json!("summer");
        assert_eq!(engine.apply_insert(p.clone()), Merge::Inserted);

        p.payload["album"] = json!("winter");
        p.revision = Revision::with_counter("remote", 2);
        assert_eq!(engine.apply_update(p), Merge::Removed);
        assert!(engine.mirror().is_empty());
    }

    #[test]
    fn foreign_kind_is_ignored() {
        let mut engine = engine();
        let track = Entity::new("t-1", "tracks", json!({}), "bob", 1, Revision::new("remote"));
        assert_eq!(engine.apply_insert(track), Merge::OutOfScope);
    }

    #[test]
    fn create_confirmed_by_correlated_event() {
        let mut engine = engine();
        engine
            .begin_create("local-1".into(), json!({"title": "X"}), 5000)
            .unwrap();
        assert_eq!(engine.mirror().ids(), &["local-1"]);

        let confirmed = photo("p-9", 1, "X").with_correlation("local-1");
        assert_eq!(
            engine.apply_event(ChangeEvent::Insert(confirmed.clone())),
            Merge::Confirmed
        );
        assert_eq!(engine.mirror().ids(), &["p-9"]);
        assert_eq!(engine.pending_count(), 0);

        // The write response arriving afterwards changes nothing.
        assert_eq!(
            engine.confirm("local-1", Some(confirmed)),
            Resolution::AlreadyResolved
        );
        assert_eq!(engine.mirror().len(), 1);
    }

    #[test]
    fn create_confirmed_by_write_response_then_event() {
        let mut engine = engine();
        engine
            .begin_create("local-1".into(), json!({"title": "X"}), 5000)
            .unwrap();
        let confirmed = photo("p-9", 1, "X").with_correlation("local-1");

        assert_eq!(
            engine.confirm("local-1", Some(confirmed.clone())),
            Resolution::Confirmed
        );
        assert_eq!(
            engine.apply_event(ChangeEvent::Insert(confirmed)),
            Merge::Unchanged
        );
        assert_eq!(engine.mirror().ids(), &["p-9"]);
        assert!(!engine.mirror().get("p-9").unwrap().is_speculative());
    }

    #[test]
    fn failed_create_leaves_no_trace() {
        let mut engine = engine();
        engine.apply_insert(photo("p-1", 1, "A"));
        let before = engine.mirror().to_vec();

        engine
            .begin_create("local-1".into(), json!({"title": "X"}), 5000)
            .unwrap();
        assert_eq!(engine.fail("local-1"), Resolution::RolledBack);
        assert_eq!(engine.mirror().to_vec(), before);
        assert!(engine.pending().is_empty());
    }

    #[test]
    fn invalid_create_never_touches_mirror() {
        let mut engine = engine();
        let result = engine.begin_create("local-1".into(), json!({"rating": 3}), 5000);
        assert!(matches!(result, Err(Error::MissingRequiredField(_))));
        assert!(engine.mirror().is_empty());
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn update_rolls_back_to_snapshot() {
        let mut engine = engine();
        engine.apply_insert(photo("p-1", 1, "A"));
        let original = engine.mirror().get("p-1").cloned().unwrap();

        engine
            .begin_update("local-1".into(), "p-1", patch(json!({"title": "B"})), 5000)
            .unwrap();
        assert!(engine.mirror().get("p-1").unwrap().is_speculative());

        assert_eq!(engine.fail("local-1"), Resolution::RolledBack);
        assert_eq!(engine.mirror().get("p-1"), Some(&original));
    }

    #[test]
    fn rollback_keeps_concurrent_edit_of_other_field() {
        let mut engine = engine();
        engine.apply_insert(photo("p-1", 1, "A"));

        engine
            .begin_update("local-1".into(), "p-1", patch(json!({"title": "B"})), 5000)
            .unwrap();
        engine
            .begin_update("local-2".into(), "p-1", patch(json!({"rating": 4})), 5001)
            .unwrap();

        engine.fail("local-1");
        let shown = engine.mirror().get("p-1").unwrap();
        assert_eq!(shown.payload["title"], "A");
        assert_eq!(shown.payload["rating"], 4);
        assert!(shown.is_speculative());
    }

    #[test]
    fn update_confirmed_by_newer_event() {
        let mut engine = engine();
        engine.apply_insert(photo("p-1", 1, "A"));
        engine
            .begin_update("local-1".into(), "p-1", patch(json!({"title": "B"})), 5000)
            .unwrap();

        // Duplicate of the pre-mutation state does not displace speculation.
        assert_eq!(
            engine.apply_event(ChangeEvent::Update(photo("p-1", 1, "A"))),
            Merge::Unchanged
        );
        assert_eq!(engine.mirror().get("p-1").unwrap().payload["title"], "B");

        let server = photo("p-1", 2, "B").with_correlation("local-1");
        assert_eq!(
            engine.apply_event(ChangeEvent::Update(server.clone())),
            Merge::Confirmed
        );
        assert_eq!(engine.mirror().get("p-1"), Some(&server));
        assert_eq!(engine.fail("local-1"), Resolution::AlreadyResolved);
    }

    #[test]
    fn confirmation_rebases_later_update() {
        let mut engine = engine();
        engine.apply_insert(photo("p-1", 1, "A"));
        engine
            .begin_update("local-1".into(), "p-1", patch(json!({"title": "B"})), 5000)
            .unwrap();
        engine
            .begin_update("local-2".into(), "p-1", patch(json!({"rating": 2})), 5001)
            .unwrap();

        engine.confirm("local-1", Some(photo("p-1", 2, "B")));
        let shown = engine.mirror().get("p-1").unwrap();
        assert_eq!(shown.payload["title"], "B");
        assert_eq!(shown.payload["rating"], 2);
        assert_eq!(shown.revision.counter, 2);
        assert_eq!(
            engine.pending_for("local-2").unwrap().base_revision().unwrap().counter,
            2
        );
    }

    #[test]
    fn delete_rolls_back_with_freshest_state() {
        let mut engine = engine();
        engine.apply_insert(photo("p-1", 1, "A"));
        engine.begin_delete("local-1".into(), "p-1", 5000).unwrap();
        assert!(engine.mirror().is_empty());

        // A concurrent edit must not resurrect the row while the delete is in flight.
        assert_eq!(
            engine.apply_event(ChangeEvent::Update(photo("p-1", 2, "edited"))),
            Merge::Suppressed
        );
        assert!(engine.mirror().is_empty());

        engine.fail("local-1");
        assert_eq!(engine.mirror().get("p-1").unwrap().payload["title"], "edited");
    }

    #[test]
    fn failed_update_does_not_revive_row_being_deleted() {
        let mut engine = engine();
        engine.apply_insert(photo("p-1", 1, "A"));
        engine
            .begin_update("local-u".into(), "p-1", patch(json!({"title": "B"})), 5000)
            .unwrap();
        engine.begin_delete("local-d".into(), "p-1", 5001).unwrap();

        assert_eq!(engine.fail("local-u"), Resolution::RolledBack);
        assert!(!engine.mirror().contains("p-1"));

        assert_eq!(engine.confirm("local-d", None), Resolution::Confirmed);
        assert!(!engine.mirror().contains("p-1"));
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn failed_delete_after_failed_update_restores_original() {
        let mut engine = engine();
        engine.apply_insert(photo("p-1", 1, "A"));
        engine
            .begin_update("local-u".into(), "p-1", patch(json!({"title": "B"})), 5000)
            .unwrap();
        engine.begin_delete("local-d".into(), "p-1", 5001).unwrap();

        engine.fail("local-u");
        engine.fail("local-d");
        assert_eq!(engine.mirror().get("p-1"), Some(&photo("p-1", 1, "A")));
    }

    #[test]
    fn late_update_confirmation_after_delete_stays_deleted() {
        let mut engine = engine();
        engine.apply_insert(photo("p-1", 1, "A"));
        engine
            .begin_update("local-u".into(), "p-1", patch(json!({"title": "B"})), 5000)
            .unwrap();
        engine.begin_delete("local-d".into(), "p-1", 5001).unwrap();

        engine.confirm("local-d", None);
        engine.confirm("local-u", Some(photo("p-1", 2, "B")));
        assert!(!engine.mirror().contains("p-1"));
    }

    #[test]
    fn update_confirmed_during_delete_is_handed_to_it() {
        let mut engine = engine();
        engine.apply_insert(photo("p-1", 1, "A"));
        engine
            .begin_update("local-u".into(), "p-1", patch(json!({"title": "B"})), 5000)
            .unwrap();
        engine.begin_delete("local-d".into(), "p-1", 5001).unwrap();
        engine.confirm("local-u", Some(photo("p-1", 2, "B")));
        assert!(!engine.mirror().contains("p-1"));
        engine.fail("local-d");
        assert_eq!(engine.mirror().get("p-1"), Some(&photo("p-1", 2, "B")));
    }

    #[test]
    fn delete_confirmed_by_event() {
        let mut engine = engine();
        engine.apply_insert(photo("p-1", 1, "A"));
        engine.begin_delete("local-1".into(), "p-1", 5000).unwrap();

        assert_eq!(
            engine.apply_event(ChangeEvent::Delete(photo("p-1", 1, "A"))),
            Merge::Confirmed
        );
        assert_eq!(engine.fail("local-1"), Resolution::AlreadyResolved);
        assert!(engine.mirror().is_empty());
    }

    #[test]
    fn deleting_speculative_create_cancels_it() {
        let mut engine = engine();
        engine
            .begin_create("local-1".into(), json!({"title": "X"}), 5000)
            .unwrap();
        assert_eq!(
            engine.begin_delete("local-2".into(), "local-1", 5001).unwrap(),
            DeleteBegin::CancelledCreate
        );
        assert!(engine.mirror().is_empty());

        // The create's echo is held back, and its committed id is reported.
        let committed = photo("p-9", 1, "X").with_correlation("local-1");
        assert_eq!(
            engine.apply_event(ChangeEvent::Insert(committed.clone())),
            Merge::Suppressed
        );
        assert!(engine.mirror().is_empty());
        assert_eq!(
            engine.confirm("local-1", Some(committed.clone())),
            Resolution::CancelledAfterCommit("p-9".into())
        );
        assert_eq!(
            engine.apply_event(ChangeEvent::Insert(committed)),
            Merge::Stale
        );
        assert!(engine.mirror().is_empty());
    }

    #[test]
    fn cancelled_create_that_failed_is_just_cancelled() {
        let mut engine = engine();
        engine
            .begin_create("local-1".into(), json!({"title": "X"}), 5000)
            .unwrap();
        engine.begin_delete("local-2".into(), "local-1", 5001).unwrap();
        assert_eq!(engine.fail("local-1"), Resolution::Cancelled);
        assert!(engine.mirror().is_empty());
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn update_of_speculative_create_is_refused() {
        let mut engine = engine();
        engine
            .begin_create("local-1".into(), json!({"title": "X"}), 5000)
            .unwrap();
        let result =
            engine.begin_update("local-2".into(), "local-1", patch(json!({"title": "Y"})), 1);
        assert!(matches!(result, Err(Error::StillPending(_))));
    }

    #[test]
    fn resync_drops_missing_and_keeps_speculation() {
        let mut engine = engine();
        engine.apply_insert(photo("p-1", 1, "A"));
        engine.apply_insert(photo("p-2", 1, "B"));
        engine
            .begin_create("local-1".into(), json!({"title": "X"}), 5000)
            .unwrap();
        engine
            .begin_update("local-2".into(), "p-2", patch(json!({"rating": 5})), 5001)
            .unwrap();

        let summary = engine.replace_all(vec![photo("p-2", 3, "B2"), photo("p-3", 1, "C")]);
        assert_eq!(summary.fetched, 2);
        assert_eq!(summary.dropped, 1);
        assert_eq!(summary.pending, 2);

        assert!(!engine.mirror().contains("p-1"));
        assert!(engine.mirror().contains("local-1"));
        let p2 = engine.mirror().get("p-2").unwrap();
        assert_eq!(p2.payload["title"], "B2");
        assert_eq!(p2.payload["rating"], 5);
    }

    #[test]
    fn resync_confirms_create_seen_in_fetch() {
        let mut engine = engine();
        engine
            .begin_create("local-1".into(), json!({"title": "X"}), 5000)
            .unwrap();
        engine.replace_all(vec![photo("p-9", 1, "X").with_correlation("local-1")]);
        assert_eq!(engine.mirror().ids(), &["p-9"]);
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn toggle_shows_speculative_marker_and_settles() {
        let mut engine = favorites();
        let begin = engine.begin_toggle("p-1", true, "local-1".into(), 10).unwrap();
        assert!(begin.changed && begin.dispatch);
        assert!(engine.flag("p-1"));

        let ToggleStep::Create(draft) = engine.next_toggle_step("p-1") else {
            panic!("expected create");
        };
        assert_eq!(draft.payload, json!({"photoId": "p-1"}));

        engine.toggle_resolved("p-1", Some(marker("f-1", "p-1", 1)));
        assert_eq!(engine.mirror().ids(), &["f-1"]);
        assert_eq!(
            engine.next_toggle_step("p-1"),
            ToggleStep::Settled { present: true }
        );
        assert!(engine.toggle_intent("p-1").is_none());
    }

    #[test]
    fn repeated_toggle_to_same_flag_is_noop() {
        let mut engine = favorites();
        engine.apply_insert(marker("f-1", "p-1", 1));
        let begin = engine.begin_toggle("p-1", true, "local-1".into(), 10).unwrap();
        assert!(!begin.changed && !begin.dispatch);
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn queued_toggles_collapse_to_latest_intent() {
        let mut engine = favorites();
        engine.begin_toggle("p-1", true, "local-1".into(), 10).unwrap();
        assert!(matches!(engine.next_toggle_step("p-1"), ToggleStep::Create(_)));

        // While the create is in flight the user toggles off, then on, then off.
        for (flag, id) in [(false, "local-2"), (true, "local-3"), (false, "local-4")] {
            let begin = engine.begin_toggle("p-1", flag, id.into(), 11).unwrap();
            assert!(!begin.dispatch);
        }
        assert!(!engine.flag("p-1"));

        engine.toggle_resolved("p-1", Some(marker("f-1", "p-1", 1)));
        assert!(engine.mirror().is_empty());
        assert_eq!(engine.next_toggle_step("p-1"), ToggleStep::Delete("f-1".into()));

        engine.toggle_resolved("p-1", None);
        assert_eq!(
            engine.next_toggle_step("p-1"),
            ToggleStep::Settled { present: false }
        );
    }

    #[test]
    fn marker_event_during_toggle_is_adopted() {
        let mut engine = favorites();
        engine.begin_toggle("p-1", true, "local-1".into(), 10).unwrap();
        engine.next_toggle_step("p-1");

        assert_eq!(
            engine.apply_event(ChangeEvent::Insert(marker("f-7", "p-1", 1))),
            Merge::Confirmed
        );
        assert_eq!(engine.mirror().ids(), &["f-7"]);
        assert_eq!(
            engine.next_toggle_step("p-1"),
            ToggleStep::Settled { present: true }
        );
    }

    #[test]
    fn failed_toggle_restores_remote_flag() {
        let mut engine = favorites();
        engine.apply_insert(marker("f-1", "p-1", 1));
        engine.begin_toggle("p-1", false, "local-1".into(), 10).unwrap();
        assert!(!engine.flag("p-1"));

        assert!(engine.toggle_failed("p-1"));
        assert_eq!(engine.mirror().ids(), &["f-1"]);
        assert!(engine.toggle_intent("p-1").is_none());
    }

    #[test]
    fn toggle_on_plain_collection_is_refused() {
        let mut engine = engine();
        let result = engine.begin_toggle("p-1", true, "local-1".into(), 10);
        assert!(matches!(result, Err(Error::NotToggleable(_))));
    }

    #[test]
    fn pending_lists_toggles() {
        let mut engine = favorites();
        engine.begin_toggle("p-1", true, "local-1".into(), 10).unwrap();
        let pending = engine.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, MutationKind::Toggle);
        assert_eq!(pending[0].target_id.as_deref(), Some("p-1"));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn arb_event() -> impl Strategy<Value = ChangeEvent> {
            (0u8..3, 0usize..4, 1u64..6, 0usize..3).prop_map(|(kind, id, counter, title)| {
                let entity = photo(&format!("p-{id}"), counter, ["A", "B", "C"][title]);
                match kind {
                    0 => ChangeEvent::Insert(entity),
                    1 => ChangeEvent::Update(entity),
                    _ => ChangeEvent::Delete(entity),
                }
            })
        }

        proptest! {
            #[test]
            fn prop_replay_is_idempotent(events in prop::collection::vec(arb_event(), 0..24)) {
                let mut engine = engine();
                for event in events.clone() {
                    engine.apply_event(event);
                }
                let once = engine.mirror().to_vec();

                for event in events {
                    engine.apply_event(event);
                }
                prop_assert_eq!(once, engine.mirror().to_vec());
            }

            #[test]
            fn prop_each_merge_is_idempotent(events in prop::collection::vec(arb_event(), 0..24)) {
                let mut engine = engine();
                for event in events {
                    engine.apply_event(event.clone());
                    let once = engine.mirror().to_vec();
                    engine.apply_event(event);
                    prop_assert_eq!(once, engine.mirror().to_vec());
                }
            }

            #[test]
            fn prop_older_revision_never_wins(
                stored in 1u64..50,
                incoming in 1u64..50,
            ) {
                let mut engine = engine();
                engine.apply_insert(photo("p-1", stored, "stored"));
                engine.apply_update(photo("p-1", incoming, "incoming"));

                let shown = engine.mirror().get("p-1").unwrap();
                let expected = if incoming >= stored { "incoming" } else { "stored" };
                prop_assert_eq!(shown.payload["title"].as_str(), Some(expected));
            }

            #[test]
            fn prop_optimistic_create_converges(
                confirm in any::<bool>(),
                echo_first in any::<bool>()
            ) {
                let confirmed = photo("p-9", 1, "X").with_correlation("local-1");

                let mut optimistic = engine();
                optimistic.begin_create("local-1".into(), json!({"title": "X"}), 5000).unwrap();
                if confirm {
                    if echo_first {
                        optimistic.apply_event(ChangeEvent::Insert(confirmed.clone()));
                        optimistic.confirm("local-1", Some(confirmed.clone()));
                    } else {
                        optimistic.confirm("local-1", Some(confirmed.clone()));
                        optimistic.apply_event(ChangeEvent::Insert(confirmed.clone()));
                    }
                } else {
                    optimistic.fail("local-1");
                }

                let mut direct = engine();
                if confirm {
                    direct.apply_event(ChangeEvent::Insert(confirmed));
                }
                prop_assert_eq!(optimistic.mirror().to_vec(), direct.mirror().to_vec());
            }
        }
    }
}
