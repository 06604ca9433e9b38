//! Error types for segment stores.

use thiserror::Error;

/// Result type alias for segment store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur against a segment store.
#[derive(Debug, Error)]
pub enum Error {
    /// The volume does not exist in the store.
    #[error("volume not found: {id}")]
    VolumeNotFound {
        /// The volume ID that was not found.
        id: String,
    },

    /// Invalid volume identifier.
    #[error("invalid volume id: {reason}")]
    InvalidVolumeId {
        /// The reason the volume ID is invalid.
        reason: String,
    },

    /// Invalid volume specification.
    #[error("invalid volume spec: {reason}")]
    InvalidVolumeSpec {
        /// The reason the spec is invalid.
        reason: String,
    },

    /// A write exceeded the volume or segment bounds.
    #[error("out of bounds: offset {offset} length {length} in volume of {size_bytes} bytes")]
    OutOfBounds {
        /// The offending offset.
        offset: u64,
        /// The offending length.
        length: u64,
        /// The volume size.
        size_bytes: u64,
    },

    /// The volume lease is held by another party.
    #[error("volume {id} is leased by node {node_id} for app {app_id}")]
    LeaseHeld {
        /// The volume ID.
        id: String,
        /// The node holding the lease.
        node_id: String,
        /// The app the lease was acquired for.
        app_id: String,
    },

    /// A release carried a nonce that does not match the current grant.
    #[error("lease nonce mismatch for volume {id}")]
    LeaseNonceMismatch {
        /// The volume ID.
        id: String,
    },

    /// The remote disk API rejected a request.
    #[error("disk api error ({status}): {message}")]
    Api {
        /// The HTTP status code.
        status: u16,
        /// The error message from the API.
        message: String,
    },

    /// Transport-level failure talking to the remote disk API.
    #[error("disk api transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
