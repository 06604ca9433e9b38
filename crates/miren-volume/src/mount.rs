//! Mount syscalls and kernel mount-table truth.
//!
//! The mount table is the authority on whether a volume is mounted. Every
//! status read goes back to `/proc/mounts`; in-memory state that disagrees
//! with the kernel is corrected, never trusted.

use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags};

use crate::error::{Error, Result};
use crate::types::Filesystem;

/// The kernel mount table.
pub const PROC_MOUNTS: &str = "/proc/mounts";

/// Unescapes the octal sequences `/proc/mounts` uses for whitespace.
fn unescape_mount_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.clone().take(3).collect();
        if digits.len() == 3 {
            if let Ok(byte) = u8::from_str_radix(&digits, 8) {
                out.push(byte as char);
                chars.nth(2);
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Extracts the mountpoints (second field) from mount-table content.
#[must_use]
pub fn parse_mount_points(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape_mount_field(field)))
        .collect()
}

/// Whether `path` appears as a mountpoint in the given mount-table content.
#[must_use]
pub fn content_lists_mount_point(content: &str, path: &Path) -> bool {
    parse_mount_points(content).iter().any(|p| p == path)
}

/// Whether `path` is currently a mountpoint according to the kernel.
pub fn is_mount_point(path: &Path) -> Result<bool> {
    let content = std::fs::read_to_string(PROC_MOUNTS)?;
    Ok(content_lists_mount_point(&content, path))
}

/// Builds the recorded option string: the caller's options passed through
/// verbatim, with `ro` prepended when the mount is read-only and the
/// options do not already say so.
#[must_use]
pub fn effective_options(options: Option<&str>, read_only: bool) -> String {
    let base = options.unwrap_or("").trim();
    let has_ro = base.split(',').any(|o| o.trim() == "ro");
    if read_only && !has_ro {
        if base.is_empty() {
            "ro".to_string()
        } else {
            format!("ro,{base}")
        }
    } else {
        base.to_string()
    }
}

/// Mounts `device` at `target` with the given filesystem and options.
pub fn mount_device(
    device: &Path,
    target: &Path,
    fs: Filesystem,
    options: Option<&str>,
    read_only: bool,
) -> Result<()> {
    let flags = if read_only {
        MsFlags::MS_RDONLY
    } else {
        MsFlags::empty()
    };
    let data = options.map(str::trim).filter(|o| !o.is_empty());

    nix::mount::mount(Some(device), target, Some(fs.name()), flags, data).map_err(|source| {
        Error::MountSyscall {
            op: "mount",
            path: target.to_path_buf(),
            source,
        }
    })
}

/// Unmounts `target`; `force` detaches even a busy mount.
pub fn unmount_path(target: &Path, force: bool) -> Result<()> {
    let flags = if force {
        MntFlags::MNT_FORCE | MntFlags::MNT_DETACH
    } else {
        MntFlags::empty()
    };
    nix::mount::umount2(target, flags).map_err(|source| Error::MountSyscall {
        op: "umount",
        path: target.to_path_buf(),
        source,
    })
}
