//! Change-feed subscriptions.
//!
//! Keeps at most one live subscription per [`ScopeKey`] and pumps its
//! messages into a [`FeedSink`]. When the transport drops, the pump
//! re-subscribes with bounded exponential backoff and hands a full re-fetch
//! to the sink as an authoritative resync: events lost while disconnected
//! are never replayed, so only a fetch can repair the mirror.

use crate::events::SyncStatus;
use crate::remote::{ChangeStream, FeedMessage, RemoteStore};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tandem_engine::{ChangeEvent, Entity, Scope, ScopeKey};
use tokio::task::JoinHandle;

/// Upper bound for a single reconnect delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Identifies one load of a scope.
///
/// The epoch grows on every scope switch, so results that carry a tag from
/// an earlier load can be recognized and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeTag {
    pub key: ScopeKey,
    pub epoch: u64,
}

impl std::fmt::Display for ScopeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.key, self.epoch)
    }
}

/// Receiver of a subscription's output.
///
/// Called from the pump task; implementations must not block.
pub trait FeedSink: Send + Sync + 'static {
    fn on_event(&self, tag: &ScopeTag, event: ChangeEvent);
    fn on_status(&self, tag: &ScopeTag, status: SyncStatus);
    /// A resync fetch is about to be issued
    fn on_refetch(&self, _tag: &ScopeTag) {}
    /// Full contents of the scope after a reconnect
    fn on_resync(&self, tag: &ScopeTag, entities: Vec<Entity>);
}

/// Handle of an open subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub id: String,
    pub tag: ScopeTag,
}

/// Reconnect policy of the pump.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub fetch_timeout: Duration,
    pub backoff: Duration,
    pub max_attempts: u32,
}

struct Live {
    handle: SubscriptionHandle,
    task: JoinHandle<()>,
}

/// Owns every live subscription of a session.
pub struct SubscriptionManager {
    remote: Arc<dyn RemoteStore>,
    policy: ReconnectPolicy,
    live: DashMap<ScopeKey, Live>,
}

impl SubscriptionManager {
    pub fn new(remote: Arc<dyn RemoteStore>, policy: ReconnectPolicy) -> Self {
        Self {
            remote,
            policy,
            live: DashMap::new(),
        }
    }

    /// Open a subscription for `scope`, or return the live one for its key.
    ///
    /// A live subscription with an older tag is replaced. One with a newer
    /// tag is returned unchanged; callers compare the handle's tag with
    /// their own to notice they were superseded.
    pub async fn open(
        &self,
        scope: &Scope,
        tag: ScopeTag,
        sink: Arc<dyn FeedSink>,
    ) -> SubscriptionHandle {
        let key = scope.key();
        if let Some(live) = self.live.get(&key) {
            if !live.task.is_finished() && live.handle.tag.epoch >= tag.epoch {
                return live.handle.clone();
            }
        }

        let stream = match self.remote.subscribe(scope).await {
            Ok(stream) => Some(stream),
            Err(err) => {
                tracing::warn!(scope = %scope, error = %err, "Subscribe failed, will retry");
                None
            }
        };

        let handle = SubscriptionHandle {
            id: uuid::Uuid::new_v4().to_string(),
            tag: tag.clone(),
        };
        let spawn = |handle: &SubscriptionHandle, stream| {
            tokio::spawn(pump(
                self.remote.clone(),
                scope.clone(),
                handle.tag.clone(),
                sink.clone(),
                stream,
                self.policy,
            ))
        };

        match self.live.entry(key) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if !current.task.is_finished() && current.handle.tag.epoch >= tag.epoch {
                    return current.handle.clone();
                }
                let task = spawn(&handle, stream);
                let stale = occupied.insert(Live {
                    handle: handle.clone(),
                    task,
                });
                stale.task.abort();
                tracing::debug!(replaced = %stale.handle.tag, "Replaced stale subscription");
            }
            Entry::Vacant(vacant) => {
                let task = spawn(&handle, stream);
                vacant.insert(Live {
                    handle: handle.clone(),
                    task,
                });
            }
        }

        tracing::info!(subscription = %handle.id, tag = %tag, "Subscription opened");
        handle
    }

    /// Close a subscription. Returns false if it was already gone.
    pub fn close(&self, handle: &SubscriptionHandle) -> bool {
        match self
            .live
            .remove_if(&handle.tag.key, |_, live| live.handle.id == handle.id)
        {
            Some((_, live)) => {
                live.task.abort();
                tracing::info!(subscription = %handle.id, tag = %handle.tag, "Subscription closed");
                true
            }
            None => false,
        }
    }

    /// Check whether a live subscription exists for `key`.
    pub fn is_open(&self, key: &ScopeKey) -> bool {
        self.live
            .get(key)
            .is_some_and(|live| !live.task.is_finished())
    }

    /// Get the number of live subscriptions.
    pub fn live_count(&self) -> usize {
        self.live
            .iter()
            .filter(|entry| !entry.value().task.is_finished())
            .count()
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        for entry in self.live.iter() {
            entry.value().task.abort();
        }
    }
}

async fn pump(
    remote: Arc<dyn RemoteStore>,
    scope: Scope,
    tag: ScopeTag,
    sink: Arc<dyn FeedSink>,
    mut stream: Option<ChangeStream>,
    policy: ReconnectPolicy,
) {
    loop {
        let reason = match stream.as_mut() {
            Some(receiver) => {
                sink.on_status(&tag, SyncStatus::Connected);
                loop {
                    match receiver.recv().await {
                        Some(FeedMessage::Event(event)) => sink.on_event(&tag, event),
                        Some(FeedMessage::Disconnected(reason)) => break reason,
                        None => break "stream closed".to_string(),
                    }
                }
            }
            None => "not subscribed".to_string(),
        };
        stream = None;

        tracing::warn!(tag = %tag, reason = %reason, "Change feed disconnected");
        sink.on_status(&tag, SyncStatus::Disconnected { reason });

        match reconnect(remote.as_ref(), &scope, &policy, || sink.on_refetch(&tag)).await {
            Ok((receiver, entities)) => {
                tracing::info!(tag = %tag, fetched = entities.len(), "Change feed reconnected");
                sink.on_resync(&tag, entities);
                stream = Some(receiver);
            }
            Err(message) => {
                tracing::error!(tag = %tag, error = %message, "Giving up on change feed");
                sink.on_status(&tag, SyncStatus::Error { message });
                return;
            }
        }
    }
}

/// Re-subscribe, then re-fetch. Both must succeed within one attempt.
async fn reconnect(
    remote: &dyn RemoteStore,
    scope: &Scope,
    policy: &ReconnectPolicy,
    before_fetch: impl Fn(),
) -> Result<(ChangeStream, Vec<Entity>), String> {
    let mut delay = policy.backoff;
    let mut last_error = "no reconnect attempts allowed".to_string();

    for attempt in 1..=policy.max_attempts {
        tokio::time::sleep(delay).await;
        delay = delay.saturating_mul(2).min(MAX_BACKOFF);

        let receiver = match remote.subscribe(scope).await {
            Ok(receiver) => receiver,
            Err(err) => {
                tracing::debug!(scope = %scope, attempt, error = %err, "Re-subscribe failed");
                last_error = err.to_string();
                continue;
            }
        };
        before_fetch();
        match tokio::time::timeout(policy.fetch_timeout, remote.fetch(scope)).await {
            Ok(Ok(entities)) => return Ok((receiver, entities)),
            Ok(Err(err)) => last_error = err.to_string(),
            Err(_) => last_error = format!("fetch timed out after {:?}", policy.fetch_timeout),
        }
        tracing::debug!(scope = %scope, attempt, error = %last_error, "Resync fetch failed");
    }

    Err(last_error)
}
