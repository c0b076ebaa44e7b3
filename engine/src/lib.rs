//! # Tandem Engine
//!
//! The deterministic core of a client-side realtime collection sync engine.
//!
//! A client renders a local mirror of a shared, multi-writer remote
//! collection. The mirror must stay consistent while the change feed
//! delivers events at least once and out of order, while the user's own
//! writes are shown optimistically before the remote store confirms them,
//! and while the user switches between scopes.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine knows nothing of networks, tasks or clocks;
//!   callers pass timestamps in
//! - **Deterministic**: the same inputs always produce the same mirror
//! - **Idempotent**: every merge can be replayed without effect
//!
//! ## Core Concepts
//!
//! ### Entities and scopes
//!
//! An [`Entity`] is one record of a collection, stamped with a
//! [`Revision`] by the remote store. A [`Scope`] names the slice of a
//! collection being mirrored; [`CollectionSchema`] describes validation,
//! ordering and join semantics per collection kind.
//!
//! ### Mirror and reconciliation
//!
//! The [`LocalMirror`] is the ordered in-memory copy the UI renders. The
//! [`ReconciliationEngine`] is its only writer: it merges change-feed
//! events with last-writer-wins by revision, applies optimistic
//! mutations, and confirms or rolls them back.
//!
//! ### Derived views
//!
//! [`project`] computes grouped counts, filtered subsets and membership
//! lookups; [`ViewCache`] memoizes them against the mirror revision.
//!
//! ## Quick Start
//!
//! ```rust
//! use tandem_engine::{
//!     ChangeEvent, CollectionSchema, Entity, FieldDef, FieldType,
//!     ReconciliationEngine, Revision, Scope,
//! };
//! use serde_json::json;
//!
//! // 1. Describe the collection
//! let schema = CollectionSchema::new(
//!     "photos",
//!     vec![FieldDef::required("title", FieldType::String)],
//! );
//!
//! // 2. Create an engine for one scope
//! let mut engine = ReconciliationEngine::new(Scope::new("home", "photos"), schema, "alice");
//!
//! // 3. Show a create before the remote store confirms it
//! engine
//!     .begin_create("local-1".into(), json!({"title": "Beach"}), 1706745600000)
//!     .unwrap();
//! assert!(engine.mirror().get("local-1").unwrap().is_speculative());
//!
//! // 4. The change feed echoes the committed entity
//! let committed = Entity::new(
//!     "p-1",
//!     "photos",
//!     json!({"title": "Beach"}),
//!     "alice",
//!     1706745600000,
//!     Revision::with_counter("remote", 1),
//! )
//! .with_correlation("local-1");
//! engine.apply_event(ChangeEvent::Insert(committed));
//!
//! assert_eq!(engine.mirror().ids(), &["p-1"]);
//! assert_eq!(engine.pending_count(), 0);
//! ```

pub mod entity;
pub mod error;
pub mod event;
pub mod mirror;
pub mod pending;
pub mod reconcile;
pub mod revision;
pub mod schema;
pub mod scope;
pub mod snapshot;
pub mod view;

// Re-export main types at crate root
pub use entity::{is_local_id, Entity, JoinKey, Origin, LOCAL_ID_PREFIX};
pub use error::Error;
pub use event::{ChangeEvent, Mutation, MutationKind};
pub use mirror::{LocalMirror, QueryBuilder};
pub use pending::{MutationStatus, PendingMutation, ToggleBegin, ToggleIntent, ToggleStep};
pub use reconcile::{DeleteBegin, Merge, ReconciliationEngine, Resolution, ResyncSummary};
pub use revision::Revision;
pub use schema::{
    compare_values, CollectionSchema, Direction, EntityKind, FieldDef, FieldType, Schema,
    SortOrder,
};
pub use scope::{Scope, ScopeKey};
pub use snapshot::{MirrorSnapshot, ScopePhase, SNAPSHOT_FORMAT_VERSION};
pub use view::{project, DerivedView, Predicate, ViewCache, ViewSpec};

/// Type aliases for clarity
pub type EntityId = String;
pub type LocalId = String;
pub type ScopeId = String;
pub type CollectionKind = String;
pub type UserId = String;
pub type WriterId = String;
pub type Timestamp = u64;
pub type SchemaVersion = u32;
pub type MirrorRevision = u64;
