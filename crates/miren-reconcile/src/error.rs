//! Error types for the reconcilers.

use thiserror::Error;

use miren_entity::EntityId;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reconciling disks and leases.
#[derive(Debug, Error)]
pub enum Error {
    /// An entity could not be decoded into its typed record.
    #[error("cannot decode {id}: {reason}")]
    Decode {
        /// The entity that failed to decode.
        id: EntityId,
        /// Why decoding failed.
        reason: String,
    },

    /// An entity of the wrong kind reached a reconciler.
    #[error("entity {id} is not a {expected}")]
    WrongKind {
        /// The entity involved.
        id: EntityId,
        /// The kind the reconciler handles.
        expected: &'static str,
    },

    /// The controller is not configured for the requested volume placement.
    #[error("configuration error: {reason}")]
    Config {
        /// What is missing or inconsistent.
        reason: String,
    },

    /// Entity database failure.
    #[error("entity store error: {0}")]
    Entity(#[from] miren_entity::Error),

    /// Volume runtime failure.
    #[error("volume store error: {0}")]
    Volume(#[from] miren_volume::Error),
}
