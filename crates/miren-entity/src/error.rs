//! Error types for the entity store.

use thiserror::Error;

use crate::entity::EntityId;

/// Result type alias for entity store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during entity store operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The entity was not found.
    #[error("entity not found: {id}")]
    NotFound {
        /// The entity ID that was not found.
        id: EntityId,
    },

    /// An entity with the same id already exists.
    #[error("entity already exists: {id}")]
    AlreadyExists {
        /// The entity ID that already exists.
        id: EntityId,
    },

    /// Invalid entity identifier.
    #[error("invalid entity id: {reason}")]
    InvalidEntityId {
        /// The reason the identifier is invalid.
        reason: String,
    },

    /// A patch carried a stale revision.
    #[error("revision conflict on {id}: expected {expected}, store at {actual}")]
    RevisionConflict {
        /// The entity ID being patched.
        id: EntityId,
        /// The revision the caller expected.
        expected: u64,
        /// The revision actually stored.
        actual: u64,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_not_found() {
        let err = Error::NotFound {
            id: EntityId::disk("d1").expect("valid id"),
        };
        assert!(err.to_string().contains("disk/d1"));
    }

    #[test]
    fn error_display_revision_conflict() {
        let err = Error::RevisionConflict {
            id: EntityId::lease("l1").expect("valid id"),
            expected: 3,
            actual: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected 3"));
        assert!(msg.contains("at 5"));
    }
}
