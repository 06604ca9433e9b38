//! # Miren Volume
//!
//! The on-node volume runtime for the Miren disk subsystem.
//!
//! A provisioned disk becomes usable through a ladder of runtime states:
//! segments exist in a store (`OnDisk`), the disk object is loaded in memory
//! (`Loaded`), and finally the volume is attached to the kernel over NBD and
//! its filesystem mounted (`Mounted`). This crate owns that ladder:
//!
//! - [`VolumeStore`]: the capability set consumed by the reconcilers, with
//!   [`LsvdVolumeStore`] as the segment-backed implementation
//! - [`nbd`]: device acquisition, index persistence for crash recovery,
//!   readiness polling, and the auto-reconnect serve handler
//! - [`format`]: superblock detection, fsck policy, and mkfs; a populated
//!   device is never reformatted
//! - [`mount`]: mount/unmount syscalls and `/proc/mounts` truth, which
//!   always outranks in-memory state
//!
//! When the kernel has no NBD support the store degrades to directory mode:
//! a plain data directory stands in for the block device, with no
//! formatting, mounting, or exclusivity nonces.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
mod exec;
pub mod format;
pub mod mount;
pub mod nbd;
pub mod store;
pub mod types;

#[cfg(any(test, feature = "test-utilities"))]
pub mod testing;

// Re-export commonly used types
pub use error::{Error, Result};
pub use format::{detect_filesystem, ensure_filesystem, FormatOutcome};
pub use nbd::{NbdLoopback, NbdStatus, ReadyWait, ReconnectDelays, ServeEnded};
pub use store::{nbd_disabled_by_env, LsvdVolumeStore, VolumeStore, DISABLE_NBD_ENV};
pub use types::{Filesystem, VolumeInfo, VolumeStatus, VolumeStoreConfig, GIB};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
