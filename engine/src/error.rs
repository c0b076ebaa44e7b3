//! Error types for the Tandem engine.

use crate::{CollectionKind, EntityId, LocalId};
use thiserror::Error;

/// All possible errors from the Tandem engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionKind),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("collection '{0}' has no join field and cannot be toggled")]
    NotToggleable(CollectionKind),

    // Mirror errors
    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("entity '{id}' does not belong to collection '{expected}'")]
    ForeignEntity { id: EntityId, expected: CollectionKind },

    #[error("entity is still being created: {0}")]
    StillPending(EntityId),

    #[error("unknown pending mutation: {0}")]
    UnknownMutation(LocalId),

    #[error("failed to decode payload: {0}")]
    Decode(String),
}

impl Error {
    /// Whether this error was raised while validating user input,
    /// before anything touched a mirror.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::CollectionNotFound(_)
                | Error::InvalidPayload(_)
                | Error::MissingRequiredField(_)
                | Error::TypeMismatch { .. }
                | Error::NotToggleable(_)
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
