//! Core types for the volume runtime.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// One gibibyte in bytes; disk sizes are declared in GiB.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Filesystems the runtime can format, check, and mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Filesystem {
    /// ext4.
    #[default]
    Ext4,

    /// XFS.
    Xfs,

    /// Btrfs.
    Btrfs,
}

impl Filesystem {
    /// The filesystem name as the kernel and tooling know it.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ext4 => "ext4",
            Self::Xfs => "xfs",
            Self::Btrfs => "btrfs",
        }
    }

    /// The mkfs command line for this filesystem.
    ///
    /// The force flag is safe here: mkfs only ever runs on a device the
    /// superblock probe found unformatted.
    #[must_use]
    pub fn mkfs_command(self, device: &str) -> Vec<String> {
        let argv: &[&str] = match self {
            Self::Ext4 => &["mkfs.ext4", "-F"],
            Self::Xfs => &["mkfs.xfs", "-f"],
            Self::Btrfs => &["mkfs.btrfs", "-f"],
        };
        argv.iter()
            .map(ToString::to_string)
            .chain(std::iter::once(device.to_string()))
            .collect()
    }

    /// The filesystem check command line for this filesystem.
    ///
    /// ext4 gets a forced repairing fsck; xfs and btrfs get read-only checks
    /// because their repair tools are not safe to run unattended.
    #[must_use]
    pub fn fsck_command(self, device: &str) -> Vec<String> {
        let argv: &[&str] = match self {
            Self::Ext4 => &["e2fsck", "-f", "-y"],
            Self::Xfs => &["xfs_repair", "-n"],
            Self::Btrfs => &["btrfs", "check", "--readonly"],
        };
        argv.iter()
            .map(ToString::to_string)
            .chain(std::iter::once(device.to_string()))
            .collect()
    }

    /// Whether an fsck exit code counts as success for this filesystem.
    ///
    /// e2fsck exits 1 or 2 when it corrected errors; both leave a usable
    /// filesystem. The read-only checkers must come back clean.
    #[must_use]
    pub const fn fsck_code_ok(self, code: i32) -> bool {
        match self {
            Self::Ext4 => matches!(code, 0 | 1 | 2),
            Self::Xfs | Self::Btrfs => code == 0,
        }
    }
}

impl fmt::Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Filesystem {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ext4" => Ok(Self::Ext4),
            "xfs" => Ok(Self::Xfs),
            "btrfs" => Ok(Self::Btrfs),
            other => Err(Error::UnsupportedFilesystem {
                id: String::new(),
                name: other.to_string(),
            }),
        }
    }
}

/// Where a volume sits on the runtime's status ladder.
///
/// The ladder is strictly ordered and moves forward one step per successful
/// operation; teardown walks it back. Kernel-truth reconciliation can demote
/// `Mounted` to `Loaded` at any observation point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeStatus {
    /// The volume does not exist.
    NotFound,

    /// Segments exist in the backing store; nothing is loaded.
    OnDisk,

    /// The disk object is loaded in memory; no kernel attachment.
    Loaded,

    /// The volume is attached over NBD and its filesystem is mounted.
    Mounted,
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "NotFound"),
            Self::OnDisk => write!(f, "OnDisk"),
            Self::Loaded => write!(f, "Loaded"),
            Self::Mounted => write!(f, "Mounted"),
        }
    }
}

/// A snapshot of a volume as the runtime sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    /// Opaque volume identifier.
    pub id: String,

    /// Total capacity in bytes.
    pub size_bytes: u64,

    /// The filesystem the volume declares.
    pub filesystem: Filesystem,

    /// Stable volume UUID.
    pub uuid: Uuid,

    /// Current status, reconciled against kernel truth.
    pub status: VolumeStatus,

    /// The mountpoint, when mounted.
    pub mount_path: Option<PathBuf>,

    /// The attached NBD device index, when attached.
    pub nbd_index: Option<u32>,
}

/// Configuration for the volume runtime.
#[derive(Debug, Clone)]
pub struct VolumeStoreConfig {
    /// Root for runtime state: volume metadata, device nodes.
    pub data_root: PathBuf,

    /// Base directory for mountpoints; mounts land at `<mount_base>/<id>`.
    pub mount_base: PathBuf,

    /// Forces directory mode regardless of NBD availability.
    pub force_directory_mode: bool,
}

impl Default for VolumeStoreConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/var/lib/miren"),
            mount_base: PathBuf::from("/var/lib/miren/disks"),
            force_directory_mode: false,
        }
    }
}

impl VolumeStoreConfig {
    /// Creates a config rooting all state under `root`, with mounts at
    /// `<root>/disks`.
    #[must_use]
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            mount_base: root.join("disks"),
            data_root: root,
            force_directory_mode: false,
        }
    }

    /// The metadata directory for a volume.
    #[must_use]
    pub fn volume_dir(&self, volume_id: &str) -> PathBuf {
        self.data_root.join("lsvd-volumes").join(volume_id)
    }

    /// The default mountpoint for a volume.
    #[must_use]
    pub fn mount_path(&self, volume_id: &str) -> PathBuf {
        self.mount_base.join(volume_id)
    }

    /// The directory-mode data directory for a volume.
    #[must_use]
    pub fn data_dir(&self, volume_id: &str) -> PathBuf {
        self.mount_base.join("disk-data").join(volume_id)
    }

    /// The directory device nodes are created under.
    #[must_use]
    pub fn devices_dir(&self) -> PathBuf {
        self.data_root.join("devices")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Filesystem::Ext4, "ext4")]
    #[test_case(Filesystem::Xfs, "xfs")]
    #[test_case(Filesystem::Btrfs, "btrfs")]
    fn filesystem_name_roundtrip(fs: Filesystem, name: &str) {
        assert_eq!(fs.name(), name);
        assert_eq!(name.parse::<Filesystem>().expect("parse"), fs);
    }

    #[test]
    fn filesystem_unknown_rejected() {
        assert!("zfs".parse::<Filesystem>().is_err());
        assert!("EXT4".parse::<Filesystem>().is_err());
    }

    #[test]
    fn mkfs_command_lines() {
        assert_eq!(
            Filesystem::Ext4.mkfs_command("/dev/nbd0"),
            vec!["mkfs.ext4", "-F", "/dev/nbd0"]
        );
        assert_eq!(
            Filesystem::Xfs.mkfs_command("/dev/nbd1"),
            vec!["mkfs.xfs", "-f", "/dev/nbd1"]
        );
        assert_eq!(
            Filesystem::Btrfs.mkfs_command("/dev/nbd2"),
            vec!["mkfs.btrfs", "-f", "/dev/nbd2"]
        );
    }

    #[test]
    fn fsck_command_lines() {
        assert_eq!(
            Filesystem::Ext4.fsck_command("/dev/nbd0"),
            vec!["e2fsck", "-f", "-y", "/dev/nbd0"]
        );
        assert_eq!(
            Filesystem::Xfs.fsck_command("/dev/nbd0"),
            vec!["xfs_repair", "-n", "/dev/nbd0"]
        );
        assert_eq!(
            Filesystem::Btrfs.fsck_command("/dev/nbd0"),
            vec!["btrfs", "check", "--readonly", "/dev/nbd0"]
        );
    }

    #[test]
    fn fsck_exit_code_policy() {
        assert!(Filesystem::Ext4.fsck_code_ok(0));
        assert!(Filesystem::Ext4.fsck_code_ok(1));
        assert!(Filesystem::Ext4.fsck_code_ok(2));
        assert!(!Filesystem::Ext4.fsck_code_ok(4));
        assert!(!Filesystem::Ext4.fsck_code_ok(8));

        assert!(Filesystem::Xfs.fsck_code_ok(0));
        assert!(!Filesystem::Xfs.fsck_code_ok(1));
        assert!(Filesystem::Btrfs.fsck_code_ok(0));
        assert!(!Filesystem::Btrfs.fsck_code_ok(1));
    }

    #[test]
    fn config_paths() {
        let config = VolumeStoreConfig::default();
        assert_eq!(
            config.volume_dir("v-1"),
            PathBuf::from("/var/lib/miren/lsvd-volumes/v-1")
        );
        assert_eq!(config.mount_path("v-1"), PathBuf::from("/var/lib/miren/disks/v-1"));
        assert_eq!(
            config.data_dir("v-1"),
            PathBuf::from("/var/lib/miren/disks/disk-data/v-1")
        );
        assert_eq!(config.devices_dir(), PathBuf::from("/var/lib/miren/devices"));
    }

    #[test]
    fn config_rooted_at() {
        let config = VolumeStoreConfig::rooted_at("/tmp/x");
        assert_eq!(config.data_root, PathBuf::from("/tmp/x"));
        assert_eq!(config.mount_base, PathBuf::from("/tmp/x/disks"));
    }
}
