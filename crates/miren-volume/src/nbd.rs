//! NBD loopback devices: acquisition, device nodes, and the reconnect
//! handler that keeps a device served.
//!
//! The kernel side (netlink setup, the NBD wire protocol engine) lives
//! behind the [`NbdLoopback`] trait and is injected by the embedding
//! runtime. Everything around it is owned here: index persistence for
//! crash recovery, device-node creation, readiness polling, and the
//! serve/reconnect loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use miren_segment::OpenVolume;

use crate::error::{Error, Result};

/// The NBD block-device major number.
pub const NBD_MAJOR: u64 = 43;

/// Minor-number range per NBD device when sysfs does not say otherwise.
pub const DEFAULT_DEVICE_RANGE: u64 = 32;

/// Name of the per-volume file recording the attached device index.
pub const NBD_INDEX_FILE: &str = "nbd-index";

/// Connection state of an NBD device as the kernel reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NbdStatus {
    /// Whether the device has a live server connection.
    pub connected: bool,
}

/// How a serve session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeEnded {
    /// The transport closed cleanly.
    Eof,

    /// The enclosing context was cancelled; do not reconnect.
    Cancelled,
}

/// The kernel NBD loopback facility.
///
/// One acquisition yields a device index whose server side the backend
/// retains internally; [`NbdLoopback::serve`] runs one transport session
/// against the given volume and returns when the transport ends or the
/// token fires.
#[async_trait]
pub trait NbdLoopback: Send + Sync + 'static {
    /// Whether the kernel exposes NBD at all.
    fn available(&self) -> bool;

    /// Requests a loopback device of the given size.
    ///
    /// When `preferred_index` names a free device it is used, which is what
    /// lets a restarted controller reattach to the same device number.
    async fn acquire(&self, size_bytes: u64, preferred_index: Option<u32>) -> Result<u32>;

    /// Reports the kernel's view of a device.
    async fn status(&self, index: u32) -> Result<NbdStatus>;

    /// Services one transport session for a device against a loaded volume.
    async fn serve(
        &self,
        index: u32,
        volume: OpenVolume,
        shutdown: CancellationToken,
    ) -> Result<ServeEnded>;

    /// Tears the device down and frees its index.
    async fn release(&self, index: u32) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Index persistence

/// Reads the persisted device index from a volume directory.
pub async fn read_nbd_index(volume_dir: &Path) -> Result<Option<u32>> {
    match tokio::fs::read_to_string(volume_dir.join(NBD_INDEX_FILE)).await {
        Ok(raw) => Ok(raw.trim().parse().ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Persists the device index for a volume.
///
/// Written before the handler starts so a crash between attach and
/// persistence cannot orphan a device.
pub async fn write_nbd_index(volume_dir: &Path, index: u32) -> Result<()> {
    tokio::fs::create_dir_all(volume_dir).await?;
    tokio::fs::write(volume_dir.join(NBD_INDEX_FILE), format!("{index}\n")).await?;
    Ok(())
}

/// Removes the persisted device index; called on clean unmount.
pub async fn clear_nbd_index(volume_dir: &Path) -> Result<()> {
    match tokio::fs::remove_file(volume_dir.join(NBD_INDEX_FILE)).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Device nodes

/// Creates and resolves `/dev`-style block nodes for attached volumes.
#[derive(Debug, Clone)]
pub struct DeviceNodes {
    devices_dir: PathBuf,
    sysfs_root: PathBuf,
}

impl DeviceNodes {
    /// Creates a manager placing nodes under `devices_dir`.
    #[must_use]
    pub fn new(devices_dir: impl Into<PathBuf>) -> Self {
        Self {
            devices_dir: devices_dir.into(),
            sysfs_root: PathBuf::from("/sys"),
        }
    }

    /// Overrides the sysfs root (tests point this at a fixture tree).
    #[must_use]
    pub fn with_sysfs_root(mut self, sysfs_root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = sysfs_root.into();
        self
    }

    /// The node path for a volume.
    #[must_use]
    pub fn node_path(&self, volume_id: &str) -> PathBuf {
        self.devices_dir.join(sanitize_device_name(volume_id))
    }

    /// Minor numbers per device, from sysfs or the default of 32.
    #[must_use]
    pub fn device_range(&self) -> u64 {
        let path = self
            .sysfs_root
            .join(format!("dev/block/{NBD_MAJOR}:0/range"));
        std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(DEFAULT_DEVICE_RANGE)
    }

    /// The minor number for a device index.
    #[must_use]
    pub fn minor_for_index(&self, index: u32) -> u64 {
        u64::from(index) * self.device_range()
    }

    /// Ensures the block node for `volume_id` on device `index` exists and
    /// returns its path.
    pub fn ensure_node(&self, volume_id: &str, index: u32) -> Result<PathBuf> {
        let path = self.node_path(volume_id);
        if path.exists() {
            return Ok(path);
        }

        std::fs::create_dir_all(&self.devices_dir)?;
        let dev = makedev(NBD_MAJOR, self.minor_for_index(index));
        mknod(
            &path,
            SFlag::S_IFBLK,
            Mode::S_IRUSR | Mode::S_IWUSR,
            dev,
        )
        .map_err(std::io::Error::from)?;

        debug!(volume_id = %volume_id, index, path = %path.display(), "device node created");
        Ok(path)
    }

    /// Removes a volume's device node if present.
    pub fn remove_node(&self, volume_id: &str) -> Result<()> {
        match std::fs::remove_file(self.node_path(volume_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Makes a volume id safe to use as a device-node file name.
#[must_use]
pub fn sanitize_device_name(volume_id: &str) -> String {
    volume_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Readiness

/// Polling parameters for device readiness.
#[derive(Debug, Clone, Copy)]
pub struct ReadyWait {
    /// How often to poll the device status.
    pub poll_interval: Duration,

    /// Total wait budget before giving up.
    pub timeout: Duration,
}

impl Default for ReadyWait {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Polls until the device reports a live connection.
///
/// The kernel needs a moment between attach and the device being usable; a
/// mount attempted too early fails.
pub async fn wait_device_ready(
    nbd: &Arc<dyn NbdLoopback>,
    index: u32,
    wait: ReadyWait,
) -> Result<()> {
    let started = tokio::time::Instant::now();
    loop {
        if nbd.status(index).await?.connected {
            return Ok(());
        }
        if started.elapsed() >= wait.timeout {
            return Err(Error::DeviceTimeout {
                index,
                waited_ms: started.elapsed().as_millis() as u64,
            });
        }
        tokio::time::sleep(wait.poll_interval).await;
    }
}

// ---------------------------------------------------------------------------
// Serve / reconnect handler

/// Backoff schedule for the reconnect handler.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectDelays {
    /// Delay before the first reconnect after an error.
    pub initial: Duration,

    /// Multiplier applied per consecutive failure.
    pub multiplier: f64,

    /// Upper bound on the failure backoff.
    pub max: Duration,

    /// Delay used after a session that served successfully.
    pub after_success: Duration,
}

impl Default for ReconnectDelays {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            multiplier: 2.0,
            max: Duration::from_secs(30),
            after_success: Duration::from_secs(1),
        }
    }
}

impl ReconnectDelays {
    /// The delay before reconnect attempt number `failures` (1-based).
    #[must_use]
    pub fn delay_for_failures(&self, failures: u32) -> Duration {
        let factor = self.multiplier.powi(failures.saturating_sub(1) as i32);
        let millis = (self.initial.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.max)
    }
}

/// Spawns the long-running handler that keeps an NBD device served.
///
/// The handler loops transport sessions against the loaded volume. When a
/// session ends, by error or clean EOF, it reconnects after a backoff, and it
/// terminates exactly when `shutdown` is cancelled.
#[must_use]
pub fn spawn_reconnect_handler(
    nbd: Arc<dyn NbdLoopback>,
    index: u32,
    volume: OpenVolume,
    delays: ReconnectDelays,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut failures = 0u32;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let delay = match nbd.serve(index, volume.clone(), shutdown.clone()).await {
                Ok(ServeEnded::Cancelled) => break,
                Ok(ServeEnded::Eof) => {
                    debug!(index, "NBD transport closed, reconnecting");
                    failures = 0;
                    delays.after_success
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = delays.delay_for_failures(failures);
                    warn!(index, error = %e, failures, "NBD transport error, backing off");
                    delay
                }
            };

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        info!(index, "NBD handler stopped");
    })
}
