//! Error types for the volume runtime.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for volume runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the volume runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// The volume is not known to the runtime or the segment store.
    #[error("volume not found: {id}")]
    VolumeNotFound {
        /// The volume ID that was not found.
        id: String,
    },

    /// The volume has an invalid size for the requested operation.
    #[error("volume {id} has invalid size {size_bytes}")]
    InvalidSize {
        /// The volume ID.
        id: String,
        /// The offending size.
        size_bytes: u64,
    },

    /// The volume declares a filesystem the runtime does not support.
    #[error("unsupported filesystem '{name}' on volume {id}")]
    UnsupportedFilesystem {
        /// The volume ID.
        id: String,
        /// The declared filesystem name.
        name: String,
    },

    /// The device carries a filesystem other than the declared one.
    #[error("device {device:?} carries {found}, volume declares {declared}; refusing to touch it")]
    FilesystemMismatch {
        /// The device path.
        device: PathBuf,
        /// The filesystem found on the device.
        found: String,
        /// The filesystem the volume declares.
        declared: String,
    },

    /// A filesystem check failed fatally on a populated device.
    #[error("filesystem check failed on {device:?} (exit code {code}): {output}")]
    CheckFailed {
        /// The device that was checked.
        device: PathBuf,
        /// The checker's exit code.
        code: i32,
        /// Captured checker output.
        output: String,
    },

    /// An external command could not be run or exited nonzero.
    #[error("command '{command}' failed (exit code {code}): {output}")]
    CommandFailed {
        /// The command line that ran.
        command: String,
        /// Exit code, or -1 if killed by a signal.
        code: i32,
        /// Captured stdout and stderr.
        output: String,
    },

    /// No NBD backend is present or the kernel lacks the module.
    #[error("NBD is unavailable on this node")]
    NbdUnavailable,

    /// The NBD device did not become ready within the wait budget.
    #[error("NBD device {index} did not become ready within {waited_ms} ms")]
    DeviceTimeout {
        /// The kernel device index.
        index: u32,
        /// How long the runtime waited.
        waited_ms: u64,
    },

    /// A mount or unmount syscall failed.
    #[error("{op} failed for {path:?}: {source}")]
    MountSyscall {
        /// Which operation failed (`mount` or `umount`).
        op: &'static str,
        /// The mountpoint involved.
        path: PathBuf,
        /// The underlying errno.
        #[source]
        source: nix::Error,
    },

    /// Errors collected while shutting the runtime down.
    #[error("shutdown completed with {} error(s): {}", errors.len(), errors.join("; "))]
    Shutdown {
        /// Individual cleanup failures, in the order they occurred.
        errors: Vec<String>,
    },

    /// Segment store failure.
    #[error("segment store error: {0}")]
    Segment(#[from] miren_segment::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_check_failed() {
        let err = Error::CheckFailed {
            device: PathBuf::from("/dev/nbd0"),
            code: 8,
            output: "superblock corrupt".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/dev/nbd0"));
        assert!(msg.contains("exit code 8"));
    }

    #[test]
    fn error_display_shutdown_collects() {
        let err = Error::Shutdown {
            errors: vec!["umount v-1: busy".to_string(), "nbd release 3: gone".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 error(s)"));
        assert!(msg.contains("busy"));
        assert!(msg.contains("gone"));
    }
}
