//! Filesystem detection, checking, and creation.
//!
//! Before a volume is mounted its device is probed for an existing
//! filesystem. A populated device is checked, never reformatted; only a
//! device with no recognizable superblock gets mkfs.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::exec;
use crate::types::Filesystem;

/// Offset of the ext superblock magic within the device.
const EXT_MAGIC_OFFSET: u64 = 0x438;
/// The ext2/3/4 superblock magic, little endian.
const EXT_MAGIC: [u8; 2] = [0x53, 0xEF];

/// XFS puts its magic at the very start of the device.
const XFS_MAGIC: &[u8; 4] = b"XFSB";

/// Offset of the btrfs superblock magic within the device.
const BTRFS_MAGIC_OFFSET: u64 = 0x10040;
const BTRFS_MAGIC: &[u8; 8] = b"_BHRfS_M";

/// What a format pass did to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatOutcome {
    /// The device was unformatted; a new filesystem was created.
    Formatted,

    /// An existing filesystem checked out clean.
    Checked,

    /// An existing filesystem had errors that fsck corrected.
    Repaired,
}

fn read_at(file: &mut std::fs::File, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    file.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Probes the device's superblock region for a known filesystem.
///
/// Returns `None` when no recognizable magic is present, i.e. the device is
/// unformatted as far as this runtime is concerned.
pub fn detect_filesystem(device: &Path) -> Result<Option<Filesystem>> {
    let mut file = std::fs::File::open(device)?;

    let mut xfs = [0u8; 4];
    if read_at(&mut file, 0, &mut xfs)? == xfs.len() && &xfs == XFS_MAGIC {
        return Ok(Some(Filesystem::Xfs));
    }

    let mut ext = [0u8; 2];
    if read_at(&mut file, EXT_MAGIC_OFFSET, &mut ext)? == ext.len() && ext == EXT_MAGIC {
        return Ok(Some(Filesystem::Ext4));
    }

    let mut btrfs = [0u8; 8];
    if read_at(&mut file, BTRFS_MAGIC_OFFSET, &mut btrfs)? == btrfs.len() && &btrfs == BTRFS_MAGIC {
        return Ok(Some(Filesystem::Btrfs));
    }

    Ok(None)
}

/// Checks the existing filesystem on `device`, applying the per-filesystem
/// exit-code policy.
pub async fn check_filesystem(device: &Path, fs: Filesystem) -> Result<FormatOutcome> {
    let device_str = device.to_string_lossy().into_owned();
    let argv = fs.fsck_command(&device_str);
    let result = exec::run(&argv).await?;

    if !fs.fsck_code_ok(result.code) {
        return Err(Error::CheckFailed {
            device: device.to_path_buf(),
            code: result.code,
            output: result.output,
        });
    }

    if result.code == 0 {
        Ok(FormatOutcome::Checked)
    } else {
        warn!(device = %device.display(), code = result.code, "fsck corrected errors");
        Ok(FormatOutcome::Repaired)
    }
}

/// Ensures `device` carries a healthy filesystem of the declared type.
///
/// - Unformatted device: mkfs.
/// - Declared filesystem present: fsck with the per-filesystem policy.
/// - A *different* filesystem present: hard error; this runtime never
///   destroys data it does not understand.
pub async fn ensure_filesystem(device: &Path, fs: Filesystem) -> Result<FormatOutcome> {
    match detect_filesystem(device)? {
        None => {
            info!(device = %device.display(), filesystem = %fs, "device unformatted, creating filesystem");
            let device_str = device.to_string_lossy().into_owned();
            exec::run_checked(&fs.mkfs_command(&device_str)).await?;
            Ok(FormatOutcome::Formatted)
        }
        Some(found) if found == fs => check_filesystem(device, fs).await,
        Some(found) => Err(Error::FilesystemMismatch {
            device: device.to_path_buf(),
            found: found.name().to_string(),
            declared: fs.name().to_string(),
        }),
    }
}
