//! Derived views: read-only projections of a mirror.
//!
//! Views are pure functions of a [`LocalMirror`]. A [`ViewCache`] memoizes
//! them against the mirror revision so repeated renders of an unchanged
//! mirror never recompute.

use crate::{Entity, EntityId, LocalMirror, MirrorRevision, ScopeKey, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Entity predicate used by filter views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Predicate {
    #[serde(rename_all = "camelCase")]
    AuthoredBy { user_id: UserId },
    FieldEquals { field: String, value: Value },
    All { of: Vec<Predicate> },
    Any { of: Vec<Predicate> },
}

impl Predicate {
    pub fn authored_by(user_id: impl Into<UserId>) -> Self {
        Predicate::AuthoredBy {
            user_id: user_id.into(),
        }
    }

    pub fn field_equals(field: impl Into<String>, value: Value) -> Self {
        Predicate::FieldEquals {
            field: field.into(),
            value,
        }
    }

    /// Evaluate against an entity.
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Predicate::AuthoredBy { user_id } => &entity.author_id == user_id,
            Predicate::FieldEquals { field, value } => entity.field(field).as_ref() == Some(value),
            Predicate::All { of } => of.iter().all(|p| p.matches(entity)),
            Predicate::Any { of } => of.iter().any(|p| p.matches(entity)),
        }
    }
}

/// What to project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ViewSpec {
    /// Count entities per distinct value of `field`
    GroupCount { field: String },
    /// Entities matching a predicate, in mirror order
    Filter { predicate: Predicate },
    /// Whether `user_id` has an entity pointing at `target_id` through
    /// `target_field`, and optionally that entity's `value_field`
    #[serde(rename_all = "camelCase")]
    Membership {
        target_field: String,
        target_id: EntityId,
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value_field: Option<String>,
    },
}

impl ViewSpec {
    pub fn group_count(field: impl Into<String>) -> Self {
        ViewSpec::GroupCount {
            field: field.into(),
        }
    }

    pub fn filter(predicate: Predicate) -> Self {
        ViewSpec::Filter { predicate }
    }

    pub fn membership(
        target_field: impl Into<String>,
        target_id: impl Into<EntityId>,
        user_id: impl Into<UserId>,
    ) -> Self {
        ViewSpec::Membership {
            target_field: target_field.into(),
            target_id: target_id.into(),
            user_id: user_id.into(),
            value_field: None,
        }
    }

    /// Builder-style method to report a field of the member entity.
    pub fn with_value_field(mut self, field: impl Into<String>) -> Self {
        if let ViewSpec::Membership { value_field, .. } = &mut self {
            *value_field = Some(field.into());
        }
        self
    }
}

/// A computed projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DerivedView {
    Groups {
        counts: BTreeMap<String, usize>,
    },
    Subset {
        entities: Vec<Entity>,
    },
    #[serde(rename_all = "camelCase")]
    Membership {
        member: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity_id: Option<EntityId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
}

impl DerivedView {
    /// Count for one group key (zero when absent or not a group view).
    pub fn count(&self, key: &str) -> usize {
        match self {
            DerivedView::Groups { counts } => counts.get(key).copied().unwrap_or(0),
            _ => 0,
        }
    }

    /// Entities of a subset view.
    pub fn entities(&self) -> &[Entity] {
        match self {
            DerivedView::Subset { entities } => entities,
            _ => &[],
        }
    }

    /// Whether a membership view found a member.
    pub fn is_member(&self) -> bool {
        matches!(self, DerivedView::Membership { member: true, .. })
    }
}

/// Compute a view from scratch.
pub fn project(mirror: &LocalMirror, spec: &ViewSpec) -> DerivedView {
    match spec {
        ViewSpec::GroupCount { field } => {
            let mut counts = BTreeMap::new();
            for value in mirror.iter().filter_map(|e| e.field(field)) {
                *counts.entry(group_key(&value)).or_insert(0) += 1;
            }
            DerivedView::Groups { counts }
        }
        ViewSpec::Filter { predicate } => DerivedView::Subset {
            entities: mirror.iter().filter(|e| predicate.matches(e)).cloned().collect(),
        },
        ViewSpec::Membership {
            target_field,
            target_id,
            user_id,
            value_field,
        } => {
            let found = mirror.iter().find(|e| {
                let target = e.payload.get(target_field).and_then(Value::as_str);
                &e.author_id == user_id && target == Some(target_id.as_str())
            });
            DerivedView::Membership {
                member: found.is_some(),
                entity_id: found.map(|e| e.id.clone()),
                value: found
                    .zip(value_field.as_ref())
                    .and_then(|(e, field)| e.field(field)),
            }
        }
    }
}

fn group_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Memo of derived views for one mirror.
///
/// Entries are valid for a single `(scope, mirror revision)` stamp; the
/// first lookup after the mirror changed drops every entry.
#[derive(Debug, Default)]
pub struct ViewCache {
    stamp: Option<(ScopeKey, MirrorRevision)>,
    views: HashMap<String, Arc<DerivedView>>,
    hits: u64,
    misses: u64,
}

impl ViewCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the memoized view, computing it if the mirror changed.
    pub fn project(&mut self, mirror: &LocalMirror, spec: &ViewSpec) -> Arc<DerivedView> {
        let stamp = (mirror.scope().key(), mirror.revision());
        if self.stamp.as_ref() != Some(&stamp) {
            self.views.clear();
            self.stamp = Some(stamp);
        }

        // Specs that cannot be serialized are computed uncached.
        let Ok(key) = serde_json::to_string(spec) else {
            self.misses += 1;
            return Arc::new(project(mirror, spec));
        };
        if let Some(view) = self.views.get(&key) {
            self.hits += 1;
            return Arc::clone(view);
        }
        self.misses += 1;
        let view = Arc::new(project(mirror, spec));
        self.views.insert(key, Arc::clone(&view));
        view
    }

    /// Drop all memoized views.
    pub fn invalidate(&mut self) {
        self.stamp = None;
        self.views.clear();
    }

    /// Number of memoized views.
    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// (hits, misses) since creation.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}
