//! Scope switching and session state.
//!
//! Each collection kind has one slot moving through
//! `Idle -> Loading -> Active -> TearingDown`. All slots live behind a
//! single mutex that is never held across an `.await`; asynchronous work
//! carries the [`ScopeTag`] it was started under and re-reads the slot by
//! tag when it resumes, so results from a scope the user already left are
//! dropped instead of leaking into the new one.

use crate::config::ClientConfig;
use crate::error::{Result, SyncError};
use crate::events::{MirrorEvent, SyncStatus};
use crate::mutation::MutationOutcome;
use crate::remote::{RemoteError, RemoteStore};
use crate::subscription::{
    FeedSink, ReconnectPolicy, ScopeTag, SubscriptionHandle, SubscriptionManager,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tandem_engine::{
    ChangeEvent, CollectionKind, DerivedView, Entity, EntityId, MirrorSnapshot, PendingMutation,
    ReconciliationEngine, ResyncSummary, Schema, Scope, ScopeKey, ScopePhase, ViewCache, ViewSpec,
};
use tokio::sync::{broadcast, oneshot};

/// Waiters of one toggle target, resolved when its intent settles.
pub(crate) type ToggleWaiters = Vec<oneshot::Sender<Result<MutationOutcome>>>;

/// State of one collection kind.
pub(crate) struct Slot {
    pub(crate) tag: ScopeTag,
    pub(crate) phase: ScopePhase,
    pub(crate) engine: ReconciliationEngine,
    /// Events received while the initial fetch is in flight
    buffer: Vec<ChangeEvent>,
    views: ViewCache,
    /// False while a resync is owed
    trusted: bool,
    /// Fetches are numbered in issue order; an answer older than the last
    /// one applied is discarded
    issued: u64,
    landed: u64,
    /// First fetch number that repairs the last disconnect
    owed: u64,
    /// Number of the resync fetch the change feed issued last
    refetch: Option<u64>,
    handle: Option<SubscriptionHandle>,
    pub(crate) toggle_waiters: HashMap<EntityId, ToggleWaiters>,
}

impl Slot {
    fn new(tag: ScopeTag, engine: ReconciliationEngine) -> Self {
        Self {
            tag,
            phase: ScopePhase::Loading,
            engine,
            buffer: Vec::new(),
            views: ViewCache::new(),
            trusted: false,
            issued: 0,
            landed: 0,
            owed: 1,
            refetch: None,
            handle: None,
            toggle_waiters: HashMap::new(),
        }
    }

    fn is_live(&self) -> bool {
        matches!(self.phase, ScopePhase::Loading | ScopePhase::Active)
    }

    /// Number the next fetch.
    fn begin_fetch(&mut self) -> u64 {
        self.issued += 1;
        self.issued
    }

    fn disconnected(&mut self) {
        self.trusted = false;
        self.owed = self.issued + 1;
    }

    /// Take the answer of fetch `number` as the truth, unless a later
    /// fetch already landed.
    fn apply_fetch(&mut self, number: u64, entities: Vec<Entity>) -> Option<ResyncSummary> {
        if number <= self.landed {
            return None;
        }
        self.landed = number;
        if number >= self.owed {
            self.trusted = true;
        }
        Some(self.engine.replace_all(entities))
    }

    /// Take a fetch result as the truth, then replay buffered events.
    fn load(&mut self, fetched: Option<(u64, Vec<Entity>)>) -> Option<ResyncSummary> {
        let summary = fetched.and_then(|(number, entities)| self.apply_fetch(number, entities));
        for event in std::mem::take(&mut self.buffer) {
            self.engine.apply_event(event);
        }
        self.phase = ScopePhase::Active;
        summary
    }
}

#[derive(Default)]
struct SessionState {
    epoch: u64,
    slots: HashMap<CollectionKind, Slot>,
}

/// State shared by the coordinator, the mutation controller and the
/// background tasks they spawn.
pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    pub(crate) schema: Schema,
    pub(crate) remote: Arc<dyn RemoteStore>,
    events: broadcast::Sender<MirrorEvent>,
    subscriptions: SubscriptionManager,
    state: Mutex<SessionState>,
}

impl Shared {
    pub(crate) fn new(
        config: ClientConfig,
        schema: Schema,
        remote: Arc<dyn RemoteStore>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity);
        let subscriptions = SubscriptionManager::new(
            remote.clone(),
            ReconnectPolicy {
                fetch_timeout: config.fetch_timeout,
                backoff: config.reconnect_backoff,
                max_attempts: config.max_reconnect_attempts,
            },
        );
        Arc::new(Self {
            config,
            schema,
            remote,
            events,
            subscriptions,
            state: Mutex::new(SessionState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<MirrorEvent> {
        self.events.subscribe()
    }

    /// Publish an event; having no receivers is fine.
    pub(crate) fn emit(&self, event: MirrorEvent) {
        let _ = self.events.send(event);
    }

    fn emit_phase(&self, scope: &ScopeKey, phase: ScopePhase) {
        tracing::info!(scope = %scope, phase = %phase, "Scope phase changed");
        self.emit(MirrorEvent::PhaseChanged {
            scope: scope.clone(),
            phase,
        });
    }

    /// Run `f` on the slot `tag` was issued for, if it is still current.
    ///
    /// Emits `Changed` when `f` moved the mirror revision.
    pub(crate) fn with_slot<T>(&self, tag: &ScopeTag, f: impl FnOnce(&mut Slot) -> T) -> Option<T> {
        let (out, changed) = {
            let mut state = self.lock();
            let slot = state
                .slots
                .get_mut(&tag.key.collection_kind)
                .filter(|slot| &slot.tag == tag)?;
            let before = slot.engine.mirror().revision();
            let out = f(slot);
            let after = slot.engine.mirror().revision();
            (out, (after != before).then_some(after))
        };
        if let Some(revision) = changed {
            self.emit(MirrorEvent::Changed {
                scope: tag.key.clone(),
                revision,
            });
        }
        Some(out)
    }

    /// Run `f` on the loading or active slot for `key`.
    pub(crate) fn with_scope<T>(
        &self,
        key: &ScopeKey,
        f: impl FnOnce(&mut Slot) -> Result<T>,
    ) -> Result<T> {
        let not_active = || SyncError::NotActive(key.clone());
        let tag = self
            .lock()
            .slots
            .get(&key.collection_kind)
            .filter(|slot| &slot.tag.key == key && slot.is_live())
            .map(|slot| slot.tag.clone())
            .ok_or_else(not_active)?;
        self.with_slot(&tag, f).unwrap_or_else(|| Err(not_active()))
    }
}

/// Feeds subscription output into the session.
struct SessionSink {
    shared: Weak<Shared>,
}

impl FeedSink for SessionSink {
    fn on_event(&self, tag: &ScopeTag, event: ChangeEvent) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.with_slot(tag, |slot| {
            if slot.phase == ScopePhase::Loading {
                slot.buffer.push(event);
                return;
            }
            let label = event.label();
            let id = event.entity_id().clone();
            let merge = slot.engine.apply_event(event);
            tracing::debug!(
                tag = %tag,
                event = label,
                entity = %id,
                merge = ?merge,
                "Applied change"
            );
        });
    }

    fn on_status(&self, tag: &ScopeTag, status: SyncStatus) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let current = shared
            .with_slot(tag, |slot| {
                if matches!(status, SyncStatus::Disconnected { .. }) {
                    slot.disconnected();
                }
            })
            .is_some();
        if current {
            shared.emit(MirrorEvent::Status {
                scope: tag.key.clone(),
                status,
            });
        }
    }

    fn on_refetch(&self, tag: &ScopeTag) {
        if let Some(shared) = self.shared.upgrade() {
            shared.with_slot(tag, |slot| slot.refetch = Some(slot.begin_fetch()));
        }
    }

    fn on_resync(&self, tag: &ScopeTag, entities: Vec<Entity>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let summary = shared
            .with_slot(tag, |slot| {
                let number = match slot.refetch.take() {
                    Some(number) => number,
                    None => slot.begin_fetch(),
                };
                let summary = slot.apply_fetch(number, entities)?;
                // Events buffered during loading predate this fetch.
                if slot.phase == ScopePhase::Loading {
                    slot.buffer.clear();
                }
                Some(summary)
            })
            .flatten();
        if let Some(summary) = summary {
            tracing::info!(
                tag = %tag,
                fetched = summary.fetched,
                dropped = summary.dropped,
                pending = summary.pending,
                "Mirror resynced"
            );
            shared.emit(MirrorEvent::Status {
                scope: tag.key.clone(),
                status: SyncStatus::Resynced {
                    dropped: summary.dropped,
                },
            });
        }
    }
}

/// Drives scope switches, fetches and read access to the mirrors.
pub struct ScopeSwitchCoordinator {
    shared: Arc<Shared>,
}

impl ScopeSwitchCoordinator {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Make `scope` the active scope of its collection kind.
    ///
    /// Tears down the kind's previous scope, subscribes, then loads the new
    /// scope with a bounded fetch. Switching to the scope that is already
    /// loading or active is a no-op. A fetch timeout leaves the scope active
    /// with whatever the change feed delivered and returns a retryable
    /// error; a transport failure is retried in the background.
    pub async fn switch_to(&self, scope: Scope) -> Result<ScopeTag> {
        let collection = self.shared.schema.collection(&scope.collection_kind)?.clone();
        let key = scope.key();

        let (tag, previous) = {
            let mut state = self.shared.lock();
            if let Some(slot) = state.slots.get(&key.collection_kind) {
                if slot.is_live() && slot.engine.scope() == &scope {
                    return Ok(slot.tag.clone());
                }
            }
            state.epoch += 1;
            let tag = ScopeTag {
                key: key.clone(),
                epoch: state.epoch,
            };
            let engine = ReconciliationEngine::new(
                scope.clone(),
                collection,
                self.shared.config.user_id.clone(),
            );
            let previous = state
                .slots
                .insert(key.collection_kind.clone(), Slot::new(tag.clone(), engine));
            (tag, previous)
        };

        if let Some(previous) = previous {
            self.retire(previous);
        }
        self.shared.emit_phase(&key, ScopePhase::Loading);

        let sink: Arc<dyn FeedSink> = Arc::new(SessionSink {
            shared: Arc::downgrade(&self.shared),
        });
        let handle = self.shared.subscriptions.open(&scope, tag.clone(), sink).await;
        if handle.tag != tag {
            return Err(SyncError::Superseded);
        }
        let attached = self
            .shared
            .with_slot(&tag, |slot| slot.handle = Some(handle.clone()))
            .is_some();
        if !attached {
            self.shared.subscriptions.close(&handle);
            return Err(SyncError::Superseded);
        }

        let number = self
            .shared
            .with_slot(&tag, Slot::begin_fetch)
            .ok_or(SyncError::Superseded)?;
        let budget = self.shared.config.fetch_timeout;
        let fetched = tokio::time::timeout(budget, self.shared.remote.fetch(&scope)).await;
        match fetched {
            Ok(Ok(entities)) => {
                let count = entities.len();
                self.finish_load(&tag, Some((number, entities)))?;
                tracing::info!(tag = %tag, fetched = count, "Scope loaded");
                Ok(tag)
            }
            Ok(Err(RemoteError::Transport(message))) => {
                tracing::warn!(
                    tag = %tag,
                    error = %message,
                    "Initial fetch failed, retrying in background"
                );
                self.finish_load(&tag, None)?;
                tokio::spawn(retry_fetch(self.shared.clone(), tag.clone(), scope));
                Ok(tag)
            }
            Ok(Err(err)) => {
                tracing::warn!(tag = %tag, error = %err, "Initial fetch rejected");
                self.finish_load(&tag, None)?;
                Err(err.into())
            }
            Err(_) => {
                tracing::warn!(tag = %tag, after = ?budget, "Initial fetch timed out");
                self.finish_load(&tag, None)?;
                Err(SyncError::Timeout {
                    operation: "fetch",
                    after: budget,
                })
            }
        }
    }

    /// Re-fetch the scope and take the result as authoritative.
    pub async fn refresh(&self, key: &ScopeKey) -> Result<ResyncSummary> {
        let (tag, scope, number) = self.shared.with_scope(key, |slot| {
            Ok((slot.tag.clone(), slot.engine.scope().clone(), slot.begin_fetch()))
        })?;

        let budget = self.shared.config.fetch_timeout;
        let entities = tokio::time::timeout(budget, self.shared.remote.fetch(&scope))
            .await
            .map_err(|_| SyncError::Timeout {
                operation: "fetch",
                after: budget,
            })??;

        let (summary, loaded) = self
            .shared
            .with_slot(&tag, |slot| {
                let loaded = slot.phase == ScopePhase::Loading;
                (slot.load(Some((number, entities))).unwrap_or_default(), loaded)
            })
            .ok_or(SyncError::Superseded)?;
        if loaded {
            self.shared.emit_phase(key, ScopePhase::Active);
        }
        tracing::info!(
            tag = %tag,
            fetched = summary.fetched,
            dropped = summary.dropped,
            "Scope refreshed"
        );
        Ok(summary)
    }

    /// Read-only snapshot of the mirror for `key`.
    pub fn get_mirror(&self, key: &ScopeKey) -> Result<MirrorSnapshot> {
        let version = self.shared.schema.version;
        self.shared.with_scope(key, |slot| {
            Ok(MirrorSnapshot::capture(&slot.engine, version, slot.phase, slot.trusted))
        })
    }

    /// Derived view over the mirror for `key`, memoized per mirror revision.
    pub fn project(&self, key: &ScopeKey, spec: &ViewSpec) -> Result<Arc<DerivedView>> {
        self.shared
            .with_scope(key, |slot| Ok(slot.views.project(slot.engine.mirror(), spec)))
    }

    /// Pending mutations of the scope, in issue order.
    pub fn pending(&self, key: &ScopeKey) -> Result<Vec<PendingMutation>> {
        self.shared.with_scope(key, |slot| Ok(slot.engine.pending()))
    }

    /// Phase of a collection kind's slot.
    pub fn phase(&self, kind: &str) -> ScopePhase {
        self.shared
            .lock()
            .slots
            .get(kind)
            .map(|slot| slot.phase)
            .unwrap_or_default()
    }

    /// Scope currently loading or active for a collection kind.
    pub fn current_scope(&self, kind: &str) -> Option<Scope> {
        self.shared
            .lock()
            .slots
            .get(kind)
            .filter(|slot| slot.is_live())
            .map(|slot| slot.engine.scope().clone())
    }

    /// Tear down every scope, returning all slots to `Idle`.
    pub fn teardown(&self) {
        let slots: Vec<Slot> = {
            let mut state = self.shared.lock();
            state.epoch += 1;
            state.slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            let key = slot.tag.key.clone();
            self.retire(slot);
            self.shared.emit_phase(&key, ScopePhase::Idle);
        }
    }

    /// Close a slot's subscription and discard its mirror.
    ///
    /// Dropping the slot drops its toggle waiters, which report
    /// `Superseded` to whoever awaits them.
    fn retire(&self, mut slot: Slot) {
        slot.phase = ScopePhase::TearingDown;
        self.shared.emit_phase(&slot.tag.key, ScopePhase::TearingDown);
        if let Some(handle) = slot.handle.take() {
            self.shared.subscriptions.close(&handle);
        }
        tracing::debug!(tag = %slot.tag, pending = slot.engine.pending_count(), "Scope discarded");
    }

    fn finish_load(&self, tag: &ScopeTag, fetched: Option<(u64, Vec<Entity>)>) -> Result<()> {
        self.shared
            .with_slot(tag, |slot| slot.load(fetched))
            .ok_or(SyncError::Superseded)?;
        self.shared.emit_phase(&tag.key, ScopePhase::Active);
        Ok(())
    }
}

/// Retry an initial fetch that failed in transit, with the reconnect
/// backoff, until it lands or the scope is left.
async fn retry_fetch(shared: Arc<Shared>, tag: ScopeTag, scope: Scope) {
    let mut delay = shared.config.reconnect_backoff;
    for attempt in 1..=shared.config.max_reconnect_attempts {
        tokio::time::sleep(delay).await;
        delay = delay.saturating_mul(2).min(Duration::from_secs(30));

        let Some(number) = shared.with_slot(&tag, Slot::begin_fetch) else {
            return;
        };
        let fetched =
            tokio::time::timeout(shared.config.fetch_timeout, shared.remote.fetch(&scope)).await;
        let entities = match fetched {
            Ok(Ok(entities)) => entities,
            Ok(Err(err)) => {
                tracing::debug!(tag = %tag, attempt, error = %err, "Background fetch failed");
                continue;
            }
            Err(_) => {
                tracing::debug!(tag = %tag, attempt, "Background fetch timed out");
                continue;
            }
        };
        let summary = shared
            .with_slot(&tag, |slot| slot.apply_fetch(number, entities))
            .flatten();
        if let Some(summary) = summary {
            shared.emit(MirrorEvent::Status {
                scope: tag.key.clone(),
                status: SyncStatus::Resynced {
                    dropped: summary.dropped,
                },
            });
        }
        return;
    }

    tracing::error!(tag = %tag, "Giving up on initial fetch");
    shared.emit(MirrorEvent::Status {
        scope: tag.key.clone(),
        status: SyncStatus::Error {
            message: "initial fetch failed".into(),
        },
    });
}
