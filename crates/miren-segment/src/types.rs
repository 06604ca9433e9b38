//! Core types for segment-backed volumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Size of a single volume segment in bytes.
///
/// Volumes are stored as a sparse sequence of fixed-size segments; a segment
/// that was never written reads back as zeroes.
pub const SEGMENT_SIZE: u64 = 1024 * 1024;

/// Specification for creating a volume in a segment store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Opaque volume identifier.
    pub id: String,

    /// Human-readable volume name.
    pub name: String,

    /// Total capacity in bytes.
    pub size_bytes: u64,

    /// Filesystem the volume will carry, e.g. `ext4`.
    pub filesystem: String,

    /// Stable volume UUID.
    pub uuid: Uuid,
}

impl VolumeSpec {
    /// Creates a spec with a fresh UUID.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            size_bytes,
            filesystem: "ext4".to_string(),
            uuid: Uuid::new_v4(),
        }
    }

    /// Sets the filesystem type.
    #[must_use]
    pub fn with_filesystem(mut self, filesystem: impl Into<String>) -> Self {
        self.filesystem = filesystem.into();
        self
    }

    /// Sets the volume UUID.
    #[must_use]
    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }
}

/// Metadata describing a volume held in a segment store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentVolumeInfo {
    /// Opaque volume identifier.
    pub id: String,

    /// Human-readable volume name.
    pub name: String,

    /// Total capacity in bytes.
    pub size_bytes: u64,

    /// Filesystem the volume carries.
    pub filesystem: String,

    /// Stable volume UUID.
    pub uuid: Uuid,

    /// When the volume was created.
    pub created_at: DateTime<Utc>,
}

impl SegmentVolumeInfo {
    /// Builds the stored metadata for a new volume.
    #[must_use]
    pub fn from_spec(spec: &VolumeSpec) -> Self {
        Self {
            id: spec.id.clone(),
            name: spec.name.clone(),
            size_bytes: spec.size_bytes,
            filesystem: spec.filesystem.clone(),
            uuid: spec.uuid,
            created_at: Utc::now(),
        }
    }

    /// Number of segments the volume spans.
    #[must_use]
    pub fn segment_count(&self) -> u64 {
        self.size_bytes.div_ceil(SEGMENT_SIZE)
    }
}

/// An exclusivity grant on a volume.
///
/// The nonce is required to release the lease again; it is what makes
/// release idempotent and safe against a stale holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseGrant {
    /// Opaque token identifying this grant.
    pub nonce: String,

    /// Node that acquired the lease.
    pub node_id: String,

    /// Application the lease was acquired for.
    pub app_id: String,

    /// When the lease was granted.
    pub acquired_at: DateTime<Utc>,
}

/// Outcome of one replica reconciliation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaReport {
    /// Segments present on the primary.
    pub total_primary: usize,

    /// Segments present on the replica.
    pub total_replica: usize,

    /// Segments the replica was missing at sweep start.
    pub missing: usize,

    /// Segments uploaded during the sweep.
    pub uploaded: usize,

    /// Upload failures during the sweep.
    pub failed: usize,
}
