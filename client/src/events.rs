//! Notifications for the UI layer.
//!
//! Every session owns one broadcast channel. The UI subscribes through
//! `SyncClient::changes` and re-renders a scope when it sees a `Changed`
//! event for it; lagging receivers simply skip to the newest revision.

use serde::Serialize;
use tandem_engine::{LocalId, MirrorRevision, ScopeKey, ScopePhase};

/// Connection state of a scope's change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SyncStatus {
    Connected,
    Disconnected { reason: String },
    /// Authoritative re-fetch applied after a reconnect
    Resynced { dropped: usize },
    Error { message: String },
}

/// A session event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MirrorEvent {
    /// The mirror of `scope` changed; re-read it
    Changed {
        scope: ScopeKey,
        revision: MirrorRevision,
    },
    /// A collection slot moved to another phase
    #[serde(rename_all = "camelCase")]
    PhaseChanged {
        scope: ScopeKey,
        phase: ScopePhase,
    },
    Status {
        scope: ScopeKey,
        status: SyncStatus,
    },
    /// A write is still waiting for the remote store
    #[serde(rename_all = "camelCase")]
    MutationStalled {
        scope: ScopeKey,
        local_id: LocalId,
    },
}

impl MirrorEvent {
    /// The scope the event concerns.
    pub fn scope(&self) -> &ScopeKey {
        match self {
            MirrorEvent::Changed { scope, .. }
            | MirrorEvent::PhaseChanged { scope, .. }
            | MirrorEvent::Status { scope, .. }
            | MirrorEvent::MutationStalled { scope, .. } => scope,
        }
    }
}
