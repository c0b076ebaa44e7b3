//! Read-only snapshots of a mirror for rendering and persistence.
//!
//! A [`MirrorSnapshot`] is what the UI receives from `get_mirror`: the
//! ordered entities plus enough bookkeeping to show loading and sync
//! indicators. Snapshots own their data and never alias engine state.

use crate::{
    error::Result, Entity, Error, MirrorRevision, ReconciliationEngine, Scope, SchemaVersion,
};
use serde::{Deserialize, Serialize};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Lifecycle phase of a collection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScopePhase {
    #[default]
    Idle,
    /// Initial fetch in progress; feed events are buffered
    Loading,
    Active,
    /// Subscription closing; results for the scope are discarded
    TearingDown,
}

impl std::fmt::Display for ScopePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScopePhase::Idle => "idle",
            ScopePhase::Loading => "loading",
            ScopePhase::Active => "active",
            ScopePhase::TearingDown => "tearing-down",
        };
        f.write_str(name)
    }
}

/// A point-in-time copy of one scope's mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Schema version the entities were validated against
    pub schema_version: SchemaVersion,
    pub scope: Scope,
    /// Entities in mirror order, speculative ones included
    pub entities: Vec<Entity>,
    /// Mirror revision at capture time
    pub revision: MirrorRevision,
    /// Unresolved local mutations
    pub pending: usize,
    pub phase: ScopePhase,
    /// False while the change feed is disconnected and a resync is owed
    pub trusted: bool,
}

impl MirrorSnapshot {
    /// Capture the current state of an engine.
    pub fn capture(
        engine: &ReconciliationEngine,
        schema_version: SchemaVersion,
        phase: ScopePhase,
        trusted: bool,
    ) -> Self {
        let mirror = engine.mirror();
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            scope: mirror.scope().clone(),
            entities: mirror.to_vec(),
            revision: mirror.revision(),
            pending: engine.pending_count(),
            phase,
            trusted,
        }
    }

    /// Get an entity by id.
    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id)
    }

    /// Ids in mirror order.
    pub fn ids(&self) -> Vec<&str> {
        self.entities.iter().map(|e| e.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Count speculative entities.
    pub fn speculative_count(&self) -> usize {
        self.entities.iter().filter(|e| e.is_speculative()).count()
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Decode(e.to_string()))
    }

    /// Deserialize from JSON, rejecting unknown format versions.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::Decode(e.to_string()))?;
        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::Decode(format!(
                "unsupported snapshot format version {}",
                snapshot.format_version
            )));
        }
        Ok(snapshot)
    }
}
