//! Scopes identify one synchronized view of a remote collection.

use crate::{CollectionKind, Entity, ScopeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Identity of a scope for subscription bookkeeping.
///
/// At most one live subscription exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeKey {
    pub scope_id: ScopeId,
    pub collection_kind: CollectionKind,
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.scope_id, self.collection_kind)
    }
}

/// A (tenant, collection kind, filter) tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    /// Tenant or workspace id
    pub scope_id: ScopeId,
    /// Collection being watched
    pub collection_kind: CollectionKind,
    /// Field equality predicate; empty matches everything
    #[serde(default)]
    pub filter: BTreeMap<String, Value>,
}

impl Scope {
    /// Create an unfiltered scope.
    pub fn new(scope_id: impl Into<ScopeId>, collection_kind: impl Into<CollectionKind>) -> Self {
        Self {
            scope_id: scope_id.into(),
            collection_kind: collection_kind.into(),
            filter: BTreeMap::new(),
        }
    }

    /// Builder-style method to add a filter entry.
    pub fn with_filter(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filter.insert(field.into(), value);
        self
    }

    /// Get the subscription key of this scope.
    pub fn key(&self) -> ScopeKey {
        ScopeKey {
            scope_id: self.scope_id.clone(),
            collection_kind: self.collection_kind.clone(),
        }
    }

    /// The same collection and filter under another tenant.
    pub fn rescoped(&self, scope_id: impl Into<ScopeId>) -> Self {
        Self {
            scope_id: scope_id.into(),
            ..self.clone()
        }
    }

    /// Check whether an entity belongs to this scope.
    pub fn matches(&self, entity: &Entity) -> bool {
        entity.kind == self.collection_kind
            && self
                .filter
                .iter()
                .all(|(field, expected)| entity.field(field).as_ref() == Some(expected))
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())?;
        if !self.filter.is_empty() {
            let parts: Vec<String> = self
                .filter
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            write!(f, "?{}", parts.join("&"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Revision;
    use serde_json::json;

    fn photo(album: &str) -> Entity {
        Entity::new(
            "p-1",
            "photos",
            json!({"album": album}),
            "alice",
            1000,
            Revision::with_counter("remote", 1),
        )
    }

    #[test]
    fn unfiltered_scope_matches_kind_only() {
        let scope = Scope::new("home", "photos");
        assert!(scope.matches(&photo("summer")));
        assert!(!Scope::new("home", "tracks").matches(&photo("summer")));
    }

    #[test]
    fn filter_matches_payload_and_pseudo_fields() {
        let scope = Scope::new("home", "photos")
            .with_filter("album", json!("summer"))
            .with_filter("authorId", json!("alice"));
        assert!(scope.matches(&photo("summer")));
        assert!(!scope.matches(&photo("winter")));
    }

    #[test]
    fn key_ignores_filter() {
        let a = Scope::new("home", "photos").with_filter("album", json!("summer"));
        let b = Scope::new("home", "photos");
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().to_string(), "home/photos");
    }

    #[test]
    fn rescoped_keeps_filter() {
        let scope = Scope::new("home", "photos").with_filter("album", json!("summer"));
        let moved = scope.rescoped("work");
        assert_eq!(moved.scope_id, "work");
        assert_eq!(moved.filter, scope.filter);
    }

    #[test]
    fn display_includes_filter() {
        let scope = Scope::new("home", "photos").with_filter("album", json!("summer"));
        assert_eq!(scope.to_string(), r#"home/photos?album="summer""#);
    }
}
