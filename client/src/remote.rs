//! Contract of the remote store collaborator.
//!
//! The remote store owns durable data. Tandem only needs three things from
//! it: a bulk read, a push change feed with at-least-once delivery, and a
//! write that may fail with a uniqueness conflict.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tandem_engine::{ChangeEvent, Entity, EntityId, LocalId, Scope, ScopeKey, UserId};
use tokio::sync::mpsc;

/// Message delivered on a change stream.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Event(ChangeEvent),
    /// The transport dropped; no further messages follow
    Disconnected(String),
}

/// Receiving end of a subscription.
pub type ChangeStream = mpsc::UnboundedReceiver<FeedMessage>;

/// The change a write performs.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Create { payload: Value },
    Update { id: EntityId, patch: Map<String, Value> },
    Delete { id: EntityId },
}

/// A remote write on behalf of the current user.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub scope: ScopeKey,
    pub author_id: UserId,
    /// Echoed back on the written entity
    pub correlation: LocalId,
    pub op: WriteOp,
}

impl WriteRequest {
    pub fn new(
        scope: ScopeKey,
        author_id: impl Into<UserId>,
        correlation: impl Into<LocalId>,
        op: WriteOp,
    ) -> Self {
        Self {
            scope,
            author_id: author_id.into(),
            correlation: correlation.into(),
            op,
        }
    }

    /// Wrap the written entity as the change event it amounts to.
    pub fn echo(&self, entity: Entity) -> ChangeEvent {
        match self.op {
            WriteOp::Create { .. } => ChangeEvent::Insert(entity),
            WriteOp::Update { .. } => ChangeEvent::Update(entity),
            WriteOp::Delete { .. } => ChangeEvent::Delete(entity),
        }
    }
}

/// Errors reported by the remote store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("transport failure: {0}")]
    Transport(String),

    /// Uniqueness violation; `existing` is the row that won, when known
    #[error("conflict: {message}")]
    Conflict {
        message: String,
        existing: Option<Box<Entity>>,
    },

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(EntityId),
}

/// Result type alias for remote calls.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Remote store abstraction.
///
/// Implementations must be cheap to share; the session holds one behind an
/// `Arc` and calls it from many tasks.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Bulk read of every entity in the scope. May be stale on arrival.
    async fn fetch(&self, scope: &Scope) -> RemoteResult<Vec<Entity>>;

    /// Open a change feed for the scope.
    async fn subscribe(&self, scope: &Scope) -> RemoteResult<ChangeStream>;

    /// Perform a write; returns the entity as committed (for deletes, the
    /// removed entity at its deletion revision).
    async fn write(&self, request: WriteRequest) -> RemoteResult<Entity>;
}
