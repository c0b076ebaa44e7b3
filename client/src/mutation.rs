//! Optimistic mutations.
//!
//! A mutation is applied to the mirror synchronously, then written to the
//! remote store by a spawned task. The task resolves the pending mutation
//! by correlation when the write answers, rolls it back on a terminal
//! failure, and reports the outcome through a [`MutationTicket`].
//!
//! Toggles are different: they only record the desired flag. One
//! dispatcher per `(target, user)` key issues writes until the remote
//! marker matches the latest intent, so rapid taps collapse instead of
//! racing each other.

use crate::coordinator::Shared;
use crate::error::{Result, SyncError};
use crate::events::MirrorEvent;
use crate::remote::{RemoteError, RemoteResult, WriteOp, WriteRequest};
use crate::subscription::ScopeTag;
use std::sync::Arc;
use tandem_engine::{
    DeleteBegin, Entity, EntityId, JoinKey, LocalId, Mutation, Resolution, ScopeKey, Timestamp,
    ToggleStep, LOCAL_ID_PREFIX,
};
use tokio::sync::oneshot;

/// Upper bound on dispatcher writes for one toggle intent.
const MAX_TOGGLE_ROUNDS: usize = 8;

/// How a mutation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// The remote store committed the write; the entity is absent when a
    /// change-feed event confirmed it first or the write was a delete of
    /// an entity that was already gone
    Committed(Option<Entity>),
    /// Cancelled locally before it took effect
    Cancelled,
    /// A toggle settled with the marker present or absent
    Toggled { present: bool },
}

/// Receipt for a submitted mutation.
///
/// The optimistic change is already visible when the ticket is returned.
#[derive(Debug)]
pub struct MutationTicket {
    pub local_id: LocalId,
    /// Entity the mutation targets; the local id for creates
    pub target_id: EntityId,
    outcome: oneshot::Receiver<Result<MutationOutcome>>,
}

impl MutationTicket {
    /// Wait for the remote store's verdict.
    ///
    /// Resolves to `Superseded` if the scope was torn down first.
    pub async fn outcome(self) -> Result<MutationOutcome> {
        self.outcome.await.unwrap_or(Err(SyncError::Superseded))
    }
}

/// Applies mutations optimistically and drives their remote writes.
pub struct OptimisticMutationController {
    shared: Arc<Shared>,
}

impl OptimisticMutationController {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Apply `mutation` to the mirror of `key` and start its remote write.
    ///
    /// Validation errors are returned before anything is applied. Must be
    /// called from within a Tokio runtime.
    pub fn submit(&self, key: &ScopeKey, mutation: Mutation) -> Result<MutationTicket> {
        self.shared
            .schema
            .validate_mutation(&key.collection_kind, &mutation)?;
        let local_id = new_local_id();
        let now = now_millis();
        let (reply, outcome) = oneshot::channel();

        let target_id = match mutation {
            Mutation::Create { payload } => {
                let tag = self.shared.with_scope(key, |slot| {
                    slot.engine.begin_create(local_id.clone(), payload.clone(), now)?;
                    Ok(slot.tag.clone())
                })?;
                self.dispatch(tag, WriteOp::Create { payload }, &local_id, reply);
                local_id.clone()
            }
            Mutation::Update { id, patch } => {
                let tag = self.shared.with_scope(key, |slot| {
                    slot.engine
                        .begin_update(local_id.clone(), &id, patch.clone(), now)?;
                    Ok(slot.tag.clone())
                })?;
                self.dispatch(tag, WriteOp::Update { id: id.clone(), patch }, &local_id, reply);
                id
            }
            Mutation::Delete { id } => {
                let (tag, begin) = self.shared.with_scope(key, |slot| {
                    let begin = slot.engine.begin_delete(local_id.clone(), &id, now)?;
                    Ok((slot.tag.clone(), begin))
                })?;
                match begin {
                    DeleteBegin::Removed => {
                        self.dispatch(tag, WriteOp::Delete { id: id.clone() }, &local_id, reply);
                    }
                    DeleteBegin::CancelledCreate => {
                        tracing::debug!(tag = %tag, entity = %id, "Cancelled in-flight create");
                        let _ = reply.send(Ok(MutationOutcome::Cancelled));
                    }
                }
                id
            }
            Mutation::Toggle { target_id, flag } => {
                self.toggle(key, &target_id, flag, &local_id, now, reply)?;
                target_id
            }
        };

        Ok(MutationTicket {
            local_id,
            target_id,
            outcome,
        })
    }

    /// Submit `mutation` and wait for its outcome.
    pub async fn mutate(&self, key: &ScopeKey, mutation: Mutation) -> Result<MutationOutcome> {
        self.submit(key, mutation)?.outcome().await
    }

    fn dispatch(
        &self,
        tag: ScopeTag,
        op: WriteOp,
        local_id: &str,
        reply: oneshot::Sender<Result<MutationOutcome>>,
    ) {
        let request = WriteRequest::new(
            tag.key.clone(),
            self.shared.config.user_id.clone(),
            local_id,
            op,
        );
        tracing::debug!(tag = %tag, local_id = %local_id, "Dispatching write");
        tokio::spawn(drive_write(self.shared.clone(), tag, request, reply));
    }

    fn toggle(
        &self,
        key: &ScopeKey,
        target_id: &str,
        flag: bool,
        local_id: &str,
        now: Timestamp,
        reply: oneshot::Sender<Result<MutationOutcome>>,
    ) -> Result<()> {
        let (tag, dispatch) = self.shared.with_scope(key, |slot| {
            let begin = slot
                .engine
                .begin_toggle(target_id, flag, local_id.to_string(), now)?;
            if slot.engine.toggle_intent(target_id).is_some() {
                slot.toggle_waiters
                    .entry(target_id.to_string())
                    .or_default()
                    .push(reply);
            } else {
                let present = slot.engine.flag(target_id);
                let _ = reply.send(Ok(MutationOutcome::Toggled { present }));
            }
            Ok((slot.tag.clone(), begin.dispatch))
        })?;

        if dispatch {
            tracing::debug!(tag = %tag, target = %target_id, flag, "Starting toggle dispatcher");
            tokio::spawn(drive_toggle(self.shared.clone(), tag, target_id.to_string()));
        }
        Ok(())
    }
}

async fn drive_write(
    shared: Arc<Shared>,
    tag: ScopeTag,
    request: WriteRequest,
    reply: oneshot::Sender<Result<MutationOutcome>>,
) {
    let mut write = shared.remote.write(request.clone());
    let notice = tokio::time::sleep(shared.config.pending_notice);
    tokio::pin!(notice);
    let deadline = tokio::time::sleep(shared.config.write_timeout);
    tokio::pin!(deadline);
    let mut stalled = false;

    let answered = loop {
        tokio::select! {
            result = &mut write => break Some(result),
            _ = &mut notice, if !stalled => {
                stalled = true;
                tracing::info!(tag = %tag, local_id = %request.correlation, "Write still pending");
                shared.emit(MirrorEvent::MutationStalled {
                    scope: tag.key.clone(),
                    local_id: request.correlation.clone(),
                });
            }
            _ = &mut deadline => break None,
        }
    };

    if let Some(result) = answered {
        let outcome = settle_write(&shared, &tag, &request, result).await;
        if let Err(err) = &outcome {
            tracing::warn!(
                tag = %tag,
                local_id = %request.correlation,
                error = %err,
                "Write failed"
            );
        }
        let _ = reply.send(outcome);
        return;
    }

    let after = shared.config.write_timeout;
    tracing::warn!(
        tag = %tag,
        local_id = %request.correlation,
        after = ?after,
        "Write timed out, rolling back"
    );
    let resolution = shared.with_slot(&tag, |slot| slot.engine.fail(&request.correlation));
    let cancelled = matches!(
        resolution,
        Some(Resolution::Cancelled | Resolution::CancelledAfterCommit(_))
    );
    let outcome = match resolution {
        Some(Resolution::RolledBack) => Err(SyncError::Timeout {
            operation: "write",
            after,
        }),
        Some(resolution) => Ok(resolved(&shared, &tag, resolution, None).await),
        None => Err(SyncError::Superseded),
    };
    let _ = reply.send(outcome);

    // The write may still land; a late answer is as good as a feed event.
    if let Ok(entity) = write.await {
        if cancelled {
            delete_committed(&shared, &tag, entity.id).await;
        } else {
            shared.with_slot(&tag, |slot| {
                let merge = slot.engine.apply_event(request.echo(entity));
                tracing::debug!(
                    tag = %tag,
                    local_id = %request.correlation,
                    merge = ?merge,
                    "Applied late write"
                );
            });
        }
    }
}

/// Turn the remote store's answer into a resolution of the pending
/// mutation.
async fn settle_write(
    shared: &Shared,
    tag: &ScopeTag,
    request: &WriteRequest,
    result: RemoteResult<Entity>,
) -> Result<MutationOutcome> {
    let committed = match (&request.op, result) {
        (_, Ok(entity)) => Some(entity),
        // Already gone is as good as deleted
        (
            WriteOp::Delete { .. },
            Err(RemoteError::NotFound(_) | RemoteError::Conflict { .. }),
        ) => None,
        (
            WriteOp::Create { .. },
            Err(RemoteError::Conflict {
                existing: Some(existing),
                ..
            }),
        ) => Some(*existing),
        (_, Err(err)) => {
            let resolution = shared.with_slot(tag, |slot| slot.engine.fail(&request.correlation));
            return match resolution {
                Some(Resolution::RolledBack) => Err(err.into()),
                Some(resolution) => Ok(resolved(shared, tag, resolution, None).await),
                None => Err(err.into()),
            };
        }
    };

    let resolution = shared.with_slot(tag, |slot| {
        let resolution = slot
            .engine
            .confirm(&request.correlation, committed.clone());
        if resolution == Resolution::AlreadyResolved {
            if let Some(entity) = committed.clone() {
                slot.engine.apply_event(request.echo(entity));
            }
        }
        resolution
    });
    match resolution {
        Some(resolution) => Ok(resolved(shared, tag, resolution, committed).await),
        None => Ok(MutationOutcome::Committed(committed)),
    }
}

async fn resolved(
    shared: &Shared,
    tag: &ScopeTag,
    resolution: Resolution,
    committed: Option<Entity>,
) -> MutationOutcome {
    match resolution {
        Resolution::Cancelled => MutationOutcome::Cancelled,
        Resolution::CancelledAfterCommit(id) => {
            delete_committed(shared, tag, id).await;
            MutationOutcome::Cancelled
        }
        Resolution::Confirmed | Resolution::AlreadyResolved | Resolution::RolledBack => {
            MutationOutcome::Committed(committed)
        }
    }
}

/// Remove an entity whose create was cancelled after the remote store
/// committed it.
async fn delete_committed(shared: &Shared, tag: &ScopeTag, id: EntityId) {
    let request = WriteRequest::new(
        tag.key.clone(),
        shared.config.user_id.clone(),
        new_local_id(),
        WriteOp::Delete { id: id.clone() },
    );
    match tokio::time::timeout(shared.config.write_timeout, shared.remote.write(request)).await {
        Ok(Ok(_)) | Ok(Err(RemoteError::NotFound(_))) => {
            tracing::debug!(tag = %tag, entity = %id, "Deleted cancelled create");
        }
        Ok(Err(err)) => {
            tracing::warn!(
                tag = %tag,
                entity = %id,
                error = %err,
                "Failed to delete cancelled create"
            );
        }
        Err(_) => {
            tracing::warn!(tag = %tag, entity = %id, "Timed out deleting cancelled create");
        }
    }
}

async fn drive_toggle(shared: Arc<Shared>, tag: ScopeTag, target_id: EntityId) {
    for round in 0..MAX_TOGGLE_ROUNDS {
        let step = shared.with_slot(&tag, |slot| {
            let step = slot.engine.next_toggle_step(&target_id);
            let waiters = if matches!(step, ToggleStep::Settled { .. }) {
                slot.toggle_waiters.remove(&target_id)
            } else {
                None
            };
            (step, waiters)
        });
        // Scope left; the waiters went with the slot
        let Some((step, waiters)) = step else {
            return;
        };

        match step {
            ToggleStep::Settled { present } => {
                tracing::debug!(
                    tag = %tag,
                    target = %target_id,
                    present,
                    rounds = round,
                    "Toggle settled"
                );
                for waiter in waiters.unwrap_or_default() {
                    let _ = waiter.send(Ok(MutationOutcome::Toggled { present }));
                }
                return;
            }
            ToggleStep::Create(draft) => {
                let request = WriteRequest::new(
                    tag.key.clone(),
                    shared.config.user_id.clone(),
                    draft.id.clone(),
                    WriteOp::Create {
                        payload: draft.payload.clone(),
                    },
                );
                let marker = match timed_write(&shared, request).await {
                    Ok(marker) => Some(marker),
                    Err(RemoteError::Conflict {
                        existing: Some(existing),
                        ..
                    }) => Some(*existing),
                    Err(RemoteError::Conflict { existing: None, .. }) => {
                        match find_marker(&shared, &tag, &target_id).await {
                            Some(marker) => Some(marker),
                            None => {
                                let err = SyncError::Rejected(
                                    "marker exists but could not be read".into(),
                                );
                                return abandon_toggle(&shared, &tag, &target_id, err);
                            }
                        }
                    }
                    Err(err) => return abandon_toggle(&shared, &tag, &target_id, err.into()),
                };
                shared.with_slot(&tag, |slot| slot.engine.toggle_resolved(&target_id, marker));
            }
            ToggleStep::Delete(id) => {
                let request = WriteRequest::new(
                    tag.key.clone(),
                    shared.config.user_id.clone(),
                    new_local_id(),
                    WriteOp::Delete { id },
                );
                match timed_write(&shared, request).await {
                    Ok(_) | Err(RemoteError::NotFound(_) | RemoteError::Conflict { .. }) => {}
                    Err(err) => return abandon_toggle(&shared, &tag, &target_id, err.into()),
                }
                shared.with_slot(&tag, |slot| slot.engine.toggle_resolved(&target_id, None));
            }
        }
    }

    let err = SyncError::Rejected(format!(
        "toggle did not settle after {MAX_TOGGLE_ROUNDS} writes"
    ));
    abandon_toggle(&shared, &tag, &target_id, err);
}

async fn timed_write(shared: &Shared, request: WriteRequest) -> RemoteResult<Entity> {
    let after = shared.config.write_timeout;
    tokio::time::timeout(after, shared.remote.write(request))
        .await
        .unwrap_or_else(|_| Err(RemoteError::Transport(format!("write timed out after {after:?}"))))
}

/// Look up the current user's marker on `target_id` with a fresh fetch.
async fn find_marker(shared: &Shared, tag: &ScopeTag, target_id: &str) -> Option<Entity> {
    let scope = shared.with_slot(tag, |slot| slot.engine.scope().clone())?;
    let join_field = shared
        .schema
        .get_collection(&tag.key.collection_kind)?
        .join_field
        .clone()?;
    let wanted = JoinKey::new(target_id, shared.config.user_id.clone());
    let fetched = tokio::time::timeout(shared.config.fetch_timeout, shared.remote.fetch(&scope))
        .await
        .ok()?
        .ok()?;
    fetched
        .into_iter()
        .find(|entity| entity.join_key(&join_field).as_ref() == Some(&wanted))
}

/// Give up on a toggle: show the last confirmed state and fail every
/// waiter with `err`.
fn abandon_toggle(shared: &Shared, tag: &ScopeTag, target_id: &str, err: SyncError) {
    tracing::warn!(tag = %tag, target = %target_id, error = %err, "Toggle failed");
    let waiters = shared.with_slot(tag, |slot| {
        slot.engine.toggle_failed(target_id);
        slot.toggle_waiters.remove(target_id)
    });
    for waiter in waiters.flatten().unwrap_or_default() {
        let _ = waiter.send(Err(err.clone()));
    }
}

fn new_local_id() -> LocalId {
    format!("{LOCAL_ID_PREFIX}{}", uuid::Uuid::new_v4())
}

/// Current time in milliseconds since the epoch.
pub(crate) fn now_millis() -> Timestamp {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::coordinator::ScopeSwitchCoordinator;
    use crate::memory::MemoryRemote;
    use serde_json::json;
    use std::time::Duration;
    use tandem_engine::{is_local_id, CollectionSchema, FieldDef, FieldType, Schema, Scope};

    struct Harness {
        remote: Arc<MemoryRemote>,
        coordinator: ScopeSwitchCoordinator,
        mutations: OptimisticMutationController,
    }

    async fn harness(config: ClientConfig) -> Harness {
        let remote = Arc::new(MemoryRemote::new().with_unique("favorites", "photoId"));
        let schema = Schema::new(1)
            .with_collection(CollectionSchema::new(
                "photos",
                vec![FieldDef::required("title", FieldType::String)],
            ))
            .with_collection(
                CollectionSchema::new(
                    "favorites",
                    vec![FieldDef::required("photoId", FieldType::String)],
                )
                .joined_on("photoId"),
            );
        let shared = Shared::new(config, schema, remote.clone());
        let coordinator = ScopeSwitchCoordinator::new(shared.clone());
        coordinator.switch_to(Scope::new("home", "photos")).await.unwrap();
        coordinator
            .switch_to(Scope::new("home", "favorites"))
            .await
            .unwrap();
        Harness {
            remote,
            coordinator,
            mutations: OptimisticMutationController::new(shared),
        }
    }

    fn photos() -> ScopeKey {
        Scope::new("home", "photos").key()
    }

    fn favorites() -> ScopeKey {
        Scope::new("home", "favorites").key()
    }

    #[tokio::test]
    async fn create_is_visible_before_the_write_answers() {
        let h = harness(ClientConfig::new("alice")).await;
        h.remote.set_write_delay(Duration::from_millis(50));

        let ticket = h
            .mutations
            .submit(&photos(), Mutation::create(json!({"title": "Dune"})))
            .unwrap();
        let snapshot = h.coordinator.get_mirror(&photos()).unwrap();
        assert_eq!(snapshot.ids(), vec![ticket.target_id.as_str()]);
        assert!(is_local_id(&ticket.target_id));

        let outcome = ticket.outcome().await.unwrap();
        let MutationOutcome::Committed(Some(entity)) = outcome else {
            panic!("expected committed entity");
        };
        let snapshot = h.coordinator.get_mirror(&photos()).unwrap();
        assert_eq!(snapshot.ids(), vec![entity.id.as_str()]);
        assert_eq!(snapshot.pending, 0);
    }

    #[tokio::test]
    async fn rejected_update_rolls_back() {
        let h = harness(ClientConfig::new("alice")).await;
        let original = h
            .remote
            .insert_external(&photos(), "bob", json!({"title": "Dune"}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.remote
            .fail_next_write(RemoteError::Rejected("read only".into()));

        let err = h
            .mutations
            .mutate(
                &photos(),
                Mutation::update(original.id.clone(), json!({"title": "Arrakis"})),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Rejected(_)));
        let snapshot = h.coordinator.get_mirror(&photos()).unwrap();
        assert_eq!(snapshot.get(&original.id).unwrap().payload["title"], "Dune");
    }

    #[tokio::test]
    async fn conflicting_update_is_rejected_and_rolls_back() {
        let h = harness(ClientConfig::new("alice")).await;
        let original = h
            .remote
            .insert_external(&photos(), "bob", json!({"title": "Dune"}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.remote.fail_next_write(RemoteError::Conflict {
            message: "title taken".into(),
            existing: None,
        });

        let err = h
            .mutations
            .mutate(
                &photos(),
                Mutation::update(original.id.clone(), json!({"title": "Arrakis"})),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Rejected(_)));
        assert!(!err.is_retryable());
        let snapshot = h.coordinator.get_mirror(&photos()).unwrap();
        assert_eq!(snapshot.get(&original.id).unwrap().payload["title"], "Dune");
        assert_eq!(snapshot.pending, 0);
    }

    #[tokio::test]
    async fn delete_of_vanished_entity_succeeds() {
        let h = harness(ClientConfig::new("alice")).await;
        let original = h
            .remote
            .insert_external(&photos(), "bob", json!({"title": "Dune"}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.remote.remove_silently(&photos(), &original.id);

        let outcome = h
            .mutations
            .mutate(&photos(), Mutation::delete(original.id.clone()))
            .await
            .unwrap();

        assert_eq!(outcome, MutationOutcome::Committed(None));
        assert!(h.coordinator.get_mirror(&photos()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleting_an_in_flight_create_cancels_it() {
        let h = harness(ClientConfig::new("alice")).await;
        h.remote.set_write_delay(Duration::from_millis(30));

        let create = h
            .mutations
            .submit(&photos(), Mutation::create(json!({"title": "Dune"})))
            .unwrap();
        let delete = h
            .mutations
            .submit(&photos(), Mutation::delete(create.target_id.clone()))
            .unwrap();

        assert_eq!(delete.outcome().await.unwrap(), MutationOutcome::Cancelled);
        assert_eq!(create.outcome().await.unwrap(), MutationOutcome::Cancelled);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.remote.entities(&photos()).is_empty());
        assert!(h.coordinator.get_mirror(&photos()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_timeout_rolls_back_and_is_retryable() {
        let config = ClientConfig::new("alice").with_write_timeout(Duration::from_millis(20));
        let h = harness(config).await;
        h.remote.set_write_delay(Duration::from_millis(80));

        let err = h
            .mutations
            .mutate(&photos(), Mutation::create(json!({"title": "Dune"})))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(h.coordinator.get_mirror(&photos()).unwrap().is_empty());

        // The late commit still shows up
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(h.coordinator.get_mirror(&photos()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stalled_writes_are_reported() {
        let config = ClientConfig::new("alice").with_pending_notice(Duration::from_millis(10));
        let h = harness(config).await;
        let mut events = h.mutations.shared.subscribe_events();
        h.remote.set_write_delay(Duration::from_millis(40));

        let ticket = h
            .mutations
            .submit(&photos(), Mutation::create(json!({"title": "Dune"})))
            .unwrap();
        let local_id = ticket.local_id.clone();
        ticket.outcome().await.unwrap();

        let mut stalled = false;
        while let Ok(event) = events.try_recv() {
            if let MirrorEvent::MutationStalled { local_id: id, .. } = event {
                stalled |= id == local_id;
            }
        }
        assert!(stalled);
    }

    #[tokio::test]
    async fn rapid_toggles_write_once_per_change() {
        let h = harness(ClientConfig::new("alice")).await;
        h.remote.set_write_delay(Duration::from_millis(20));

        let on = h
            .mutations
            .submit(&favorites(), Mutation::toggle("p-1", true))
            .unwrap();
        let off = h
            .mutations
            .submit(&favorites(), Mutation::toggle("p-1", false))
            .unwrap();
        let on_again = h
            .mutations
            .submit(&favorites(), Mutation::toggle("p-1", true))
            .unwrap();

        for ticket in [on, off, on_again] {
            assert_eq!(
                ticket.outcome().await.unwrap(),
                MutationOutcome::Toggled { present: true }
            );
        }
        assert_eq!(h.remote.entities(&favorites()).len(), 1);
        assert_eq!(h.remote.writes().len(), 1);
    }

    #[tokio::test]
    async fn toggle_conflict_adopts_existing_marker() {
        let h = harness(ClientConfig::new("alice")).await;
        // Written from another device; the feed never delivered it
        let existing = h
            .remote
            .insert_silently(&favorites(), "alice", json!({"photoId": "p-1"}));

        let outcome = h
            .mutations
            .mutate(&favorites(), Mutation::toggle("p-1", true))
            .await
            .unwrap();

        assert_eq!(outcome, MutationOutcome::Toggled { present: true });
        let snapshot = h.coordinator.get_mirror(&favorites()).unwrap();
        assert_eq!(snapshot.ids(), vec![existing.id.as_str()]);
        assert_eq!(h.remote.entities(&favorites()).len(), 1);
    }

    #[tokio::test]
    async fn anonymous_conflict_looks_the_marker_up() {
        let h = harness(ClientConfig::new("alice")).await;
        let existing = h
            .remote
            .insert_silently(&favorites(), "alice", json!({"photoId": "p-1"}));
        h.remote.fail_next_write(RemoteError::Conflict {
            message: "duplicate".into(),
            existing: None,
        });

        let outcome = h
            .mutations
            .mutate(&favorites(), Mutation::toggle("p-1", true))
            .await
            .unwrap();

        assert_eq!(outcome, MutationOutcome::Toggled { present: true });
        let snapshot = h.coordinator.get_mirror(&favorites()).unwrap();
        assert_eq!(snapshot.ids(), vec![existing.id.as_str()]);
    }

    #[tokio::test]
    async fn failed_toggle_restores_confirmed_state() {
        let h = harness(ClientConfig::new("alice")).await;
        h.remote
            .fail_next_write(RemoteError::Transport("offline".into()));

        let err = h
            .mutations
            .mutate(&favorites(), Mutation::toggle("p-1", true))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Transport(_)));
        assert!(h.coordinator.get_mirror(&favorites()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_payload_never_touches_the_mirror() {
        let h = harness(ClientConfig::new("alice")).await;

        let err = h
            .mutations
            .submit(&photos(), Mutation::create(json!({"title": 7})))
            .unwrap_err();

        assert!(matches!(err, SyncError::Validation(_)));
        let snapshot = h.coordinator.get_mirror(&photos()).unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.pending, 0);
        assert!(h.remote.writes().is_empty());
    }
}
