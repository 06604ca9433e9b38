//! # Miren Segment
//!
//! Segment-backed volume storage for the Miren disk subsystem.
//!
//! A volume's durable bytes live as fixed-size segments in a container. The
//! [`SegmentStore`] trait abstracts where that container is:
//!
//! - [`LocalSegmentStore`]: files under `<data-root>/lsvd-volumes/<vol-id>`
//! - [`RemoteSegmentStore`]: the authenticated disk API over HTTP
//! - [`ReplicaWriter`]: a local primary mirrored to a remote replica, with a
//!   background [`ReplicaReconciler`] uploading whatever the replica missed
//!
//! [`OpenVolume`] is the loaded disk object: byte-addressed I/O over the
//! segments, which is what the NBD handler serves.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod local;
pub mod remote;
pub mod replica;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use local::LocalSegmentStore;
pub use remote::RemoteSegmentStore;
pub use replica::{ReplicaReconciler, ReplicaWriter, DEFAULT_SWEEP_INTERVAL};
pub use store::{OpenVolume, SegmentStore};
pub use types::{LeaseGrant, ReplicaReport, SegmentVolumeInfo, VolumeSpec, SEGMENT_SIZE};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
