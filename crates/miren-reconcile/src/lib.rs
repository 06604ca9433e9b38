//! # Miren Reconcile
//!
//! Disk and lease reconcilers for the Miren disk subsystem.
//!
//! Declarative `Disk` and `DiskLease` records in the entity database are the
//! system's source of truth; the reconcilers here turn them into live,
//! mounted volumes and tear them back down:
//!
//! - [`DiskReconciler`] drives a disk from `PROVISIONING` to `PROVISIONED`,
//!   allocating (or attaching to) its backing volume
//! - [`LeaseReconciler`] binds a sandbox's lease to a provisioned disk
//!   (exclusivity nonce, disk initialization, mount) and enforces that a
//!   disk has at most one bound lease on this node
//! - [`DiskWatcher`] wakes pending leases when their disk becomes ready
//!
//! The reconcilers implement the [`Reconciler`] contract driven by the
//! external reconcile scheduler; everything is idempotent under redelivery
//! and crash-restart, with the entity database as the recovery authority.
//!
//! The single-lessee guarantee is scoped to one controller process. Running
//! several controllers against one database needs a distributed claim;
//! the entity store's revision-checked patch is the natural CAS for it.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod disk;
pub mod error;
pub mod lease;
pub mod reconciler;
pub mod types;
pub mod watcher;

// Re-export commonly used types
pub use disk::DiskReconciler;
pub use error::{Error, Result};
pub use lease::{LeaseReconciler, GC_INTERVAL, GC_MAX_AGE, RESYNC_INTERVAL};
pub use reconciler::{Reconciler, VolumeStores};
pub use types::{Disk, DiskLease, DiskStatus, LeaseStatus, MountSpec};
pub use watcher::DiskWatcher;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
