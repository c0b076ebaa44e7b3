//! Revision markers for ordering concurrent writes.
//!
//! The remote store stamps every confirmed entity with a revision. Merges
//! compare revisions, never arrival order, so a late or duplicated event
//! cannot roll an entity back.

use crate::WriterId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A revision marker that provides a total order over writes.
///
/// Ordering rules:
/// 1. Higher counter wins
/// 2. If counters equal, lexicographically higher writer wins
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    /// Identifier of the writer that produced this revision
    pub writer: WriterId,
    /// Monotonically increasing counter (or a millisecond timestamp)
    pub counter: u64,
}

impl Revision {
    /// Create the initial revision for a writer.
    pub fn new(writer: impl Into<WriterId>) -> Self {
        Self {
            writer: writer.into(),
            counter: 0,
        }
    }

    /// Create a revision with a specific counter value.
    pub fn with_counter(writer: impl Into<WriterId>, counter: u64) -> Self {
        Self {
            writer: writer.into(),
            counter,
        }
    }

    /// Increment the counter and return the new value.
    pub fn tick(&mut self) -> &Self {
        self.counter += 1;
        self
    }

    /// Advance this revision to be at least as recent as another.
    pub fn merge(&mut self, other: &Revision) {
        self.counter = self.counter.max(other.counter);
    }

    /// True if `self` is strictly older than `other`.
    ///
    /// This is the last-writer-wins test: an incoming entity is rejected
    /// only when its revision is older than the stored one, so replaying
    /// the same revision is always accepted (and changes nothing).
    pub fn is_older_than(&self, other: &Revision) -> bool {
        self < other
    }

    /// True if both revisions carry the same counter from different writers.
    pub fn is_concurrent_with(&self, other: &Revision) -> bool {
        self.counter == other.counter && self.writer != other.writer
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.counter.cmp(&other.counter) {
            Ordering::Equal => self.writer.cmp(&other.writer),
            other => other,
        }
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.counter, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_revision_starts_at_zero() {
        let rev = Revision::new("remote");
        assert_eq!(rev.counter, 0);
        assert_eq!(rev.writer, "remote");
    }

    #[test]
    fn tick_increments_counter() {
        let mut rev = Revision::new("remote");
        rev.tick();
        rev.tick();
        assert_eq!(rev.counter, 2);
    }

    #[test]
    fn ordering_by_counter_then_writer() {
        assert!(Revision::with_counter("b", 1) < Revision::with_counter("a", 2));
        assert!(Revision::with_counter("a", 5) < Revision::with_counter("b", 5));
    }

    #[test]
    fn merge_takes_max_counter() {
        let mut rev = Revision::with_counter("client", 3);
        rev.merge(&Revision::with_counter("remote", 7));
        assert_eq!(rev.counter, 7);
        assert_eq!(rev.writer, "client");

        rev.merge(&Revision::with_counter("remote", 2));
        assert_eq!(rev.counter, 7);
    }

    #[test]
    fn equal_revision_is_not_older() {
        let a = Revision::with_counter("remote", 4);
        assert!(!a.is_older_than(&a.clone()));
        assert!(Revision::with_counter("remote", 3).is_older_than(&a));
    }

    #[test]
    fn concurrent_revisions() {
        let a = Revision::with_counter("a", 5);
        assert!(a.is_concurrent_with(&Revision::with_counter("b", 5)));
        assert!(!a.is_concurrent_with(&Revision::with_counter("a", 5)));
    }

    #[test]
    fn display_format() {
        assert_eq!(Revision::with_counter("remote", 12).to_string(), "12@remote");
    }

    #[test]
    fn serialization_format() {
        let json = serde_json::to_string(&Revision::with_counter("remote", 10)).unwrap();
        assert!(json.contains("writer"));
        assert!(json.contains("counter"));
    }
}
