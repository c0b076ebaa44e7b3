//! # Tandem Client
//!
//! The session layer of Tandem: it connects [`tandem_engine`] mirrors to a
//! remote store. It owns the change-feed subscriptions, the optimistic
//! write pipeline and the per-collection scope state machine, and exposes
//! them to a UI through [`SyncClient`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tandem_client::{ClientConfig, MemoryRemote, SyncClient};
//! use tandem_engine::{CollectionSchema, FieldDef, FieldType, Mutation, Schema, Scope};
//!
//! # async fn demo() -> tandem_client::Result<()> {
//! let schema = Schema::new(1).with_collection(CollectionSchema::new(
//!     "photos",
//!     vec![FieldDef::required("title", FieldType::String)],
//! ));
//! let client = SyncClient::new(ClientConfig::new("alice"), schema, Arc::new(MemoryRemote::new()));
//!
//! let scope = Scope::new("home", "photos");
//! client.switch_to(scope.clone()).await?;
//! client
//!     .mutate(&scope.key(), Mutation::create(json!({"title": "Beach"})))
//!     .await?;
//!
//! let mirror = client.get_mirror(&scope.key())?;
//! assert_eq!(mirror.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod memory;
pub mod mutation;
pub mod remote;
pub mod subscription;

pub use config::{ClientConfig, ConfigError};
pub use coordinator::ScopeSwitchCoordinator;
pub use error::{Result, SyncError};
pub use events::{MirrorEvent, SyncStatus};
pub use memory::MemoryRemote;
pub use mutation::{MutationOutcome, MutationTicket, OptimisticMutationController};
pub use remote::{
    ChangeStream, FeedMessage, RemoteError, RemoteResult, RemoteStore, WriteOp, WriteRequest,
};
pub use subscription::{
    FeedSink, ReconnectPolicy, ScopeTag, SubscriptionHandle, SubscriptionManager,
};

use coordinator::Shared;
use std::sync::Arc;
use tandem_engine::{
    DerivedView, MirrorSnapshot, Mutation, PendingMutation, ResyncSummary, Schema, Scope, ScopeKey,
    ScopePhase, ViewSpec,
};
use tokio::sync::broadcast;

/// A sync session for one user.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct SyncClient {
    shared: Arc<Shared>,
    coordinator: ScopeSwitchCoordinator,
    mutations: OptimisticMutationController,
}

impl SyncClient {
    /// Create a session. Nothing is fetched until [`SyncClient::switch_to`].
    pub fn new(config: ClientConfig, schema: Schema, remote: Arc<dyn RemoteStore>) -> Self {
        tracing::info!(
            user_id = %config.user_id,
            node_id = %config.node_id,
            "Starting sync session"
        );
        let shared = Shared::new(config, schema, remote);
        Self {
            coordinator: ScopeSwitchCoordinator::new(shared.clone()),
            mutations: OptimisticMutationController::new(shared.clone()),
            shared,
        }
    }

    /// Make `scope` the active scope of its collection kind.
    pub async fn switch_to(&self, scope: Scope) -> Result<ScopeTag> {
        self.coordinator.switch_to(scope).await
    }

    /// Re-fetch a scope, e.g. after a fetch timeout.
    pub async fn refresh(&self, key: &ScopeKey) -> Result<ResyncSummary> {
        self.coordinator.refresh(key).await
    }

    pub fn get_mirror(&self, key: &ScopeKey) -> Result<MirrorSnapshot> {
        self.coordinator.get_mirror(key)
    }

    pub fn project(&self, key: &ScopeKey, spec: &ViewSpec) -> Result<Arc<DerivedView>> {
        self.coordinator.project(key, spec)
    }

    /// Apply a mutation optimistically; see [`OptimisticMutationController::submit`].
    pub fn submit(&self, key: &ScopeKey, mutation: Mutation) -> Result<MutationTicket> {
        self.mutations.submit(key, mutation)
    }

    /// Apply a mutation and wait for the remote store's verdict.
    pub async fn mutate(&self, key: &ScopeKey, mutation: Mutation) -> Result<MutationOutcome> {
        self.mutations.mutate(key, mutation).await
    }

    /// Subscribe to session events.
    pub fn changes(&self) -> broadcast::Receiver<MirrorEvent> {
        self.shared.subscribe_events()
    }

    pub fn phase(&self, kind: &str) -> ScopePhase {
        self.coordinator.phase(kind)
    }

    pub fn pending(&self, key: &ScopeKey) -> Result<Vec<PendingMutation>> {
        self.coordinator.pending(key)
    }

    /// Tear down every scope (logout).
    pub fn teardown(&self) {
        self.coordinator.teardown();
    }

    pub fn coordinator(&self) -> &ScopeSwitchCoordinator {
        &self.coordinator
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }
}
