//! In-memory remote store.
//!
//! Behaves like a small multi-writer backend: it assigns ids and
//! revisions, enforces unique markers on join collections and pushes change
//! events to every subscriber of a scope. Knobs let tests and the demo
//! inject the failure modes a real network produces (slow fetches, slow or
//! failing writes, duplicate delivery, dropped connections).

use crate::remote::{
    ChangeStream, FeedMessage, RemoteError, RemoteResult, RemoteStore, WriteOp, WriteRequest,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tandem_engine::{
    ChangeEvent, CollectionKind, Entity, EntityId, Revision, Scope, ScopeId, ScopeKey, UserId,
};
use tokio::sync::mpsc;

/// A live subscriber.
#[derive(Debug)]
struct Subscriber {
    key: ScopeKey,
    sender: mpsc::UnboundedSender<FeedMessage>,
}

/// In-memory [`RemoteStore`].
#[derive(Debug)]
pub struct MemoryRemote {
    writer: String,
    counter: AtomicU64,
    tables: DashMap<ScopeKey, BTreeMap<EntityId, Entity>>,
    subscribers: DashMap<String, Subscriber>,
    /// Join field per collection kind; markers are unique per (target, author)
    unique: HashMap<CollectionKind, String>,
    fetch_delays: DashMap<ScopeId, Duration>,
    held_fetches: Mutex<VecDeque<Duration>>,
    write_delay: Mutex<Duration>,
    failures: Mutex<VecDeque<RemoteError>>,
    subscribe_failures: AtomicU64,
    fetch_failures: AtomicU64,
    duplicate_delivery: AtomicBool,
    writes: Mutex<Vec<WriteRequest>>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            writer: "remote".into(),
            counter: AtomicU64::new(0),
            tables: DashMap::new(),
            subscribers: DashMap::new(),
            unique: HashMap::new(),
            fetch_delays: DashMap::new(),
            held_fetches: Mutex::new(VecDeque::new()),
            write_delay: Mutex::new(Duration::ZERO),
            failures: Mutex::new(VecDeque::new()),
            subscribe_failures: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
            duplicate_delivery: AtomicBool::new(false),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Builder-style method to enforce unique markers on a join collection.
    pub fn with_unique(
        mut self,
        kind: impl Into<CollectionKind>,
        join_field: impl Into<String>,
    ) -> Self {
        self.unique.insert(kind.into(), join_field.into());
        self
    }

    /// Delay every fetch of `scope_id`.
    pub fn set_fetch_delay(&self, scope_id: impl Into<ScopeId>, delay: Duration) {
        self.fetch_delays.insert(scope_id.into(), delay);
    }

    /// Answer the next fetch late: it reads the store at once, then holds
    /// the answer for `delay` as if stuck in transit.
    pub fn hold_next_fetch(&self, delay: Duration) {
        self.held_fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(delay);
    }

    /// Delay every write.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Fail the next write with `error` instead of committing it.
    pub fn fail_next_write(&self, error: RemoteError) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    /// Refuse the next `count` subscribe calls.
    pub fn fail_next_subscribes(&self, count: u64) {
        self.subscribe_failures.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` fetches with a transport error.
    pub fn fail_next_fetches(&self, count: u64) {
        self.fetch_failures.store(count, Ordering::SeqCst);
    }

    /// Deliver every change event twice.
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.duplicate_delivery.store(enabled, Ordering::SeqCst);
    }

    /// Every write request received so far, committed or not.
    pub fn writes(&self) -> Vec<WriteRequest> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current contents of a scope, ordered by id.
    pub fn entities(&self, key: &ScopeKey) -> Vec<Entity> {
        self.tables
            .get(key)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of open subscriptions for a scope.
    pub fn subscriber_count(&self, key: &ScopeKey) -> usize {
        self.subscribers
            .iter()
            .filter(|entry| &entry.value().key == key && !entry.value().sender.is_closed())
            .count()
    }

    /// Commit a create from another writer and broadcast it.
    pub fn insert_external(
        &self,
        key: &ScopeKey,
        author_id: impl Into<UserId>,
        payload: Value,
    ) -> Entity {
        let entity = Entity::new(
            uuid::Uuid::new_v4().to_string(),
            key.collection_kind.clone(),
            payload,
            author_id,
            crate::mutation::now_millis(),
            self.next_revision(),
        );
        self.store(key, entity.clone());
        self.broadcast(key, ChangeEvent::Insert(entity.clone()));
        entity
    }

    /// Commit a create without telling anyone, as if its insert event was
    /// lost in transit.
    pub fn insert_silently(
        &self,
        key: &ScopeKey,
        author_id: impl Into<UserId>,
        payload: Value,
    ) -> Entity {
        let entity = Entity::new(
            uuid::Uuid::new_v4().to_string(),
            key.collection_kind.clone(),
            payload,
            author_id,
            crate::mutation::now_millis(),
            self.next_revision(),
        );
        self.store(key, entity.clone());
        entity
    }

    /// Patch an entity as another writer would, broadcasting the update.
    pub fn update_external(&self, key: &ScopeKey, id: &str, patch: Value) -> Option<Entity> {
        let patch = patch.as_object()?.clone();
        let mut entity = self.tables.get(key)?.get(id)?.patched(&patch);
        entity.revision = self.next_revision();
        entity.correlation = None;
        self.store(key, entity.clone());
        self.broadcast(key, ChangeEvent::Update(entity.clone()));
        Some(entity)
    }

    /// Remove an entity as another writer would, broadcasting the delete.
    pub fn remove_external(&self, key: &ScopeKey, id: &str) -> Option<Entity> {
        let mut removed = self.tables.get_mut(key)?.remove(id)?;
        removed.revision = self.next_revision();
        self.broadcast(key, ChangeEvent::Delete(removed.clone()));
        Some(removed)
    }

    /// Remove an entity without telling anyone, as if its delete event was
    /// lost in transit.
    pub fn remove_silently(&self, key: &ScopeKey, id: &str) -> Option<Entity> {
        self.tables.get_mut(key)?.remove(id)
    }

    /// Drop every subscription of a scope with a disconnect notice.
    pub fn disconnect(&self, key: &ScopeKey) -> usize {
        let ids: Vec<String> = self
            .subscribers
            .iter()
            .filter(|entry| &entry.value().key == key)
            .map(|entry| entry.key().clone())
            .collect();
        for id in &ids {
            if let Some((_, subscriber)) = self.subscribers.remove(id) {
                let _ = subscriber
                    .sender
                    .send(FeedMessage::Disconnected("connection reset".into()));
            }
        }
        tracing::debug!(scope = %key, dropped = ids.len(), "Disconnected subscribers");
        ids.len()
    }

    fn next_revision(&self) -> Revision {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Revision::with_counter(self.writer.clone(), counter)
    }

    fn store(&self, key: &ScopeKey, entity: Entity) {
        self.tables
            .entry(key.clone())
            .or_default()
            .insert(entity.id.clone(), entity);
    }

    /// Push an event to every subscriber of `key`.
    ///
    /// Returns the number of subscribers that received it.
    fn broadcast(&self, key: &ScopeKey, event: ChangeEvent) -> usize {
        let copies = if self.duplicate_delivery.load(Ordering::SeqCst) {
            2
        } else {
            1
        };
        let mut sent = 0;
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if &subscriber.key != key {
                continue;
            }
            let delivered = (0..copies).all(|_| {
                subscriber
                    .sender
                    .send(FeedMessage::Event(event.clone()))
                    .is_ok()
            });
            if delivered {
                sent += 1;
            } else {
                closed.push(entry.key().clone());
            }
        }
        for id in closed {
            self.subscribers.remove(&id);
        }

        tracing::trace!(scope = %key, event = event.label(), recipients = sent, "Broadcast change");
        sent
    }

    fn find_marker(
        &self,
        key: &ScopeKey,
        join_field: &str,
        payload: &Value,
        author_id: &str,
    ) -> Option<Entity> {
        let target = payload.get(join_field)?;
        self.tables
            .get(key)?
            .values()
            .find(|e| e.author_id == author_id && e.payload.get(join_field) == Some(target))
            .cloned()
    }

    fn commit(&self, request: &WriteRequest) -> RemoteResult<Entity> {
        let key = &request.scope;
        match &request.op {
            WriteOp::Create { payload } => {
                if let Some(join_field) = self.unique.get(&key.collection_kind) {
                    let existing = self.find_marker(key, join_field, payload, &request.author_id);
                    if let Some(existing) = existing {
                        return Err(RemoteError::Conflict {
                            message: format!("duplicate key on {join_field}"),
                            existing: Some(Box::new(existing)),
                        });
                    }
                }
                let entity = Entity::new(
                    uuid::Uuid::new_v4().to_string(),
                    key.collection_kind.clone(),
                    payload.clone(),
                    request.author_id.clone(),
                    crate::mutation::now_millis(),
                    self.next_revision(),
                )
                .with_correlation(request.correlation.clone());
                self.store(key, entity.clone());
                self.broadcast(key, ChangeEvent::Insert(entity.clone()));
                Ok(entity)
            }
            WriteOp::Update { id, patch } => {
                let current = self
                    .tables
                    .get(key)
                    .and_then(|table| table.get(id).cloned())
                    .ok_or_else(|| RemoteError::NotFound(id.clone()))?;
                let mut entity = current.patched(patch);
                entity.revision = self.next_revision();
                entity.correlation = Some(request.correlation.clone());
                self.store(key, entity.clone());
                self.broadcast(key, ChangeEvent::Update(entity.clone()));
                Ok(entity)
            }
            WriteOp::Delete { id } => {
                let mut removed = self
                    .tables
                    .get_mut(key)
                    .and_then(|mut table| table.remove(id))
                    .ok_or_else(|| RemoteError::NotFound(id.clone()))?;
                removed.revision = self.next_revision();
                removed.correlation = Some(request.correlation.clone());
                self.broadcast(key, ChangeEvent::Delete(removed.clone()));
                Ok(removed)
            }
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch(&self, scope: &Scope) -> RemoteResult<Vec<Entity>> {
        let delay = self
            .fetch_delays
            .get(&scope.scope_id)
            .map(|d| *d)
            .unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if take_one(&self.fetch_failures) {
            return Err(RemoteError::Transport("fetch failed".into()));
        }
        let entities: Vec<Entity> = self
            .entities(&scope.key())
            .into_iter()
            .filter(|e| scope.matches(e))
            .collect();
        let held = self
            .held_fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(held) = held {
            tokio::time::sleep(held).await;
        }
        Ok(entities)
    }

    async fn subscribe(&self, scope: &Scope) -> RemoteResult<ChangeStream> {
        if take_one(&self.subscribe_failures) {
            return Err(RemoteError::Transport("subscribe refused".into()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let id = uuid::Uuid::new_v4().to_string();
        self.subscribers.insert(
            id.clone(),
            Subscriber {
                key: scope.key(),
                sender,
            },
        );
        tracing::debug!(subscriber = %id, scope = %scope, "Subscriber registered");
        Ok(receiver)
    }

    async fn write(&self, request: WriteRequest) -> RemoteResult<Entity> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let delay = *self.write_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        self.commit(&request)
    }
}

/// Decrement a failure budget; true if one was left.
fn take_one(budget: &AtomicU64) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}
