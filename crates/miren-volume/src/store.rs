//! The volume store: the on-node runtime that owns NBD devices, formatting,
//! and mounts.
//!
//! State discipline: the per-volume runtime map sits behind one async mutex
//! held across entire operations, because mounts and NBD attachments are
//! inherently serial per volume and the kernel is shared. Kernel truth
//! always wins: every status read re-checks the mount table first.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use miren_segment::{OpenVolume, SegmentStore, VolumeSpec};

use crate::error::{Error, Result};
use crate::format;
use crate::mount;
use crate::nbd::{
    clear_nbd_index, read_nbd_index, spawn_reconnect_handler, wait_device_ready, write_nbd_index,
    DeviceNodes, NbdLoopback, ReadyWait, ReconnectDelays,
};
use crate::types::{Filesystem, VolumeInfo, VolumeStatus, VolumeStoreConfig, GIB};

/// Environment variable that forces directory mode even when NBD exists.
pub const DISABLE_NBD_ENV: &str = "MIREN_DISABLE_NBD";

/// Whether the environment forces directory mode.
#[must_use]
pub fn nbd_disabled_by_env() -> bool {
    std::env::var_os(DISABLE_NBD_ENV).is_some_and(|v| v == "1")
}

/// The on-node volume capability set.
///
/// All operations are idempotent. Three concrete flavors exist in practice
/// (full local, local with remote replica, remote-only), differing only in
/// the segment store behind them; tests use an in-memory mock.
#[async_trait]
pub trait VolumeStore: Send + Sync + 'static {
    /// Ensures the volume exists in the backing segment store. No kernel
    /// state is touched.
    async fn ensure_in_segment_store(
        &self,
        volume_id: &str,
        size_gib: u64,
        filesystem: Filesystem,
    ) -> Result<()>;

    /// Loads the volume's disk object into memory (no kernel attachment).
    async fn initialize_disk(&self, volume_id: &str) -> Result<()>;

    /// Attaches the volume over NBD, ensures its filesystem, and mounts it.
    ///
    /// `target` overrides the default mountpoint of `<mount-base>/<id>`.
    /// Returns the mountpoint.
    async fn mount(
        &self,
        volume_id: &str,
        target: Option<&Path>,
        read_only: bool,
        options: Option<&str>,
    ) -> Result<PathBuf>;

    /// Unmounts the volume and detaches its NBD device, returning it to
    /// `Loaded`. A volume that is not mounted is a no-op.
    async fn unmount(&self, volume_id: &str) -> Result<()>;

    /// Whether the volume is mounted, per the kernel mount table.
    async fn is_mounted(&self, volume_id: &str) -> Result<bool>;

    /// A status snapshot reconciled against kernel truth.
    async fn get_info(&self, volume_id: &str) -> Result<VolumeInfo>;

    /// Snapshots of every volume in the backing store.
    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>>;

    /// Releases all runtime state for the volume. Backing segments are
    /// retained; the store does not yet support deleting them.
    async fn unprovision(&self, volume_id: &str) -> Result<()>;

    /// Acquires the volume's remote exclusivity lease, returning its nonce.
    async fn acquire_volume_lease(
        &self,
        volume_id: &str,
        node_id: &str,
        app_id: &str,
    ) -> Result<String>;

    /// Releases a previously acquired lease by nonce.
    async fn release_volume_lease(&self, volume_id: &str, nonce: &str) -> Result<()>;

    /// Whether this store runs in directory mode (no NBD on this kernel).
    fn directory_mode(&self) -> bool;

    /// Creates the directory-mode data directory for a volume.
    async fn ensure_data_dir(&self, volume_id: &str) -> Result<PathBuf>;

    /// Whether the directory-mode data directory exists.
    async fn data_dir_exists(&self, volume_id: &str) -> Result<bool>;

    /// Shuts the runtime down: force-unmounts everything, stops handlers,
    /// releases devices. Proceeds past individual failures and reports them
    /// together.
    async fn close(&self) -> Result<()>;
}

/// Per-volume runtime state.
struct VolumeRuntime {
    open: Option<OpenVolume>,
    mounted: bool,
    mount_path: Option<PathBuf>,
    device_path: Option<PathBuf>,
    nbd_index: Option<u32>,
    handler: Option<JoinHandle<()>>,
    handler_token: Option<CancellationToken>,
}

impl VolumeRuntime {
    fn new() -> Self {
        Self {
            open: None,
            mounted: false,
            mount_path: None,
            device_path: None,
            nbd_index: None,
            handler: None,
            handler_token: None,
        }
    }

    fn status(&self) -> VolumeStatus {
        if self.mounted {
            VolumeStatus::Mounted
        } else if self.open.is_some() {
            VolumeStatus::Loaded
        } else {
            VolumeStatus::OnDisk
        }
    }
}

/// The segment-backed volume store.
pub struct LsvdVolumeStore {
    config: VolumeStoreConfig,
    segments: Arc<dyn SegmentStore>,
    nbd: Option<Arc<dyn NbdLoopback>>,
    nodes: DeviceNodes,
    directory_mode: bool,
    delays: ReconnectDelays,
    ready_wait: ReadyWait,
    volumes: Mutex<HashMap<String, VolumeRuntime>>,
    shutdown: CancellationToken,
}

impl LsvdVolumeStore {
    /// Creates a volume store over a segment store and an optional NBD
    /// backend. Directory mode is chosen here, once: no backend, an
    /// unavailable backend, or the disable environment variable all select
    /// it.
    #[must_use]
    pub fn new(
        config: VolumeStoreConfig,
        segments: Arc<dyn SegmentStore>,
        nbd: Option<Arc<dyn NbdLoopback>>,
    ) -> Self {
        let nbd_usable = nbd.as_ref().is_some_and(|n| n.available());
        let directory_mode = config.force_directory_mode || nbd_disabled_by_env() || !nbd_usable;
        if directory_mode {
            info!("volume store running in directory mode");
        }

        let nodes = DeviceNodes::new(config.devices_dir());
        Self {
            config,
            segments,
            nbd,
            nodes,
            directory_mode,
            delays: ReconnectDelays::default(),
            ready_wait: ReadyWait::default(),
            volumes: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Overrides the reconnect backoff schedule.
    #[must_use]
    pub fn with_reconnect_delays(mut self, delays: ReconnectDelays) -> Self {
        self.delays = delays;
        self
    }

    /// Overrides the device readiness wait.
    #[must_use]
    pub fn with_ready_wait(mut self, ready_wait: ReadyWait) -> Self {
        self.ready_wait = ready_wait;
        self
    }

    /// The runtime configuration.
    #[must_use]
    pub fn config(&self) -> &VolumeStoreConfig {
        &self.config
    }

    fn nbd(&self) -> Result<Arc<dyn NbdLoopback>> {
        self.nbd.clone().ok_or(Error::NbdUnavailable)
    }

    /// Corrects in-memory state against the kernel mount table.
    fn sync_mount_truth(runtime: &mut VolumeRuntime, volume_id: &str) -> Result<()> {
        if !runtime.mounted {
            return Ok(());
        }
        let listed = match &runtime.mount_path {
            Some(path) => mount::is_mount_point(path)?,
            None => false,
        };
        if !listed {
            warn!(
                volume_id = %volume_id,
                mount_path = ?runtime.mount_path,
                "mount table disagrees with recorded state, demoting to Loaded"
            );
            runtime.mounted = false;
            runtime.mount_path = None;
        }
        Ok(())
    }

    async fn load_volume(&self, runtime: &mut VolumeRuntime, volume_id: &str) -> Result<()> {
        if runtime.open.is_some() {
            return Ok(());
        }
        let info = match self.segments.volume_info(volume_id).await {
            Ok(info) => info,
            Err(miren_segment::Error::VolumeNotFound { id }) => {
                return Err(Error::VolumeNotFound { id });
            }
            Err(e) => return Err(e.into()),
        };
        if info.size_bytes == 0 {
            return Err(Error::InvalidSize {
                id: volume_id.to_string(),
                size_bytes: 0,
            });
        }
        runtime.open = Some(OpenVolume::new(Arc::clone(&self.segments), info));
        debug!(volume_id = %volume_id, "disk object loaded");
        Ok(())
    }

    /// Stops the handler and frees the device. Best-effort: failures are
    /// reported back as strings so shutdown can keep going.
    async fn detach_nbd(&self, runtime: &mut VolumeRuntime, volume_id: &str) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(token) = runtime.handler_token.take() {
            token.cancel();
        }
        if let Some(handler) = runtime.handler.take() {
            if handler.await.is_err() {
                errors.push(format!("nbd handler for {volume_id} panicked"));
            }
        }
        if let Some(index) = runtime.nbd_index.take() {
            if let Ok(nbd) = self.nbd() {
                if let Err(e) = nbd.release(index).await {
                    errors.push(format!("release nbd {index} for {volume_id}: {e}"));
                }
            }
            if let Err(e) = self.nodes.remove_node(volume_id) {
                errors.push(format!("remove device node for {volume_id}: {e}"));
            }
            if let Err(e) = clear_nbd_index(&self.config.volume_dir(volume_id)).await {
                errors.push(format!("clear nbd-index for {volume_id}: {e}"));
            }
        }
        runtime.device_path = None;
        errors
    }

    /// Attaches the volume over NBD, reusing a live prior attachment when
    /// the kernel still has it.
    async fn attach_nbd(
        &self,
        runtime: &mut VolumeRuntime,
        volume_id: &str,
        open: &OpenVolume,
    ) -> Result<PathBuf> {
        let nbd = self.nbd()?;

        if let (Some(index), Some(path)) = (runtime.nbd_index, runtime.device_path.clone()) {
            if nbd.status(index).await?.connected {
                debug!(volume_id = %volume_id, index, "reusing live NBD attachment");
                return Ok(path);
            }
            warn!(volume_id = %volume_id, index, "recorded NBD attachment is dead, reattaching");
            for e in self.detach_nbd(runtime, volume_id).await {
                warn!(volume_id = %volume_id, error = %e, "stale attachment cleanup");
            }
        }

        let volume_dir = self.config.volume_dir(volume_id);
        let preferred = read_nbd_index(&volume_dir).await?;
        let index = nbd.acquire(open.size_bytes(), preferred).await?;
        write_nbd_index(&volume_dir, index).await?;

        let device_path = self.nodes.ensure_node(volume_id, index)?;

        let token = self.shutdown.child_token();
        let handler = spawn_reconnect_handler(
            Arc::clone(&nbd),
            index,
            open.clone(),
            self.delays,
            token.clone(),
        );
        runtime.nbd_index = Some(index);
        runtime.device_path = Some(device_path.clone());
        runtime.handler = Some(handler);
        runtime.handler_token = Some(token);

        if let Err(e) = wait_device_ready(&nbd, index, self.ready_wait).await {
            for cleanup in self.detach_nbd(runtime, volume_id).await {
                warn!(volume_id = %volume_id, error = %cleanup, "teardown after readiness timeout");
            }
            return Err(e);
        }

        info!(volume_id = %volume_id, index, device = %device_path.display(), "NBD device attached");
        Ok(device_path)
    }
}

#[async_trait]
impl VolumeStore for LsvdVolumeStore {
    async fn ensure_in_segment_store(
        &self,
        volume_id: &str,
        size_gib: u64,
        filesystem: Filesystem,
    ) -> Result<()> {
        if size_gib == 0 {
            return Err(Error::InvalidSize {
                id: volume_id.to_string(),
                size_bytes: 0,
            });
        }

        self.segments.init_container().await?;
        let spec = VolumeSpec::new(volume_id, volume_id, size_gib * GIB)
            .with_filesystem(filesystem.name());
        self.segments.init_volume(&spec).await?;
        Ok(())
    }

    async fn initialize_disk(&self, volume_id: &str) -> Result<()> {
        let mut volumes = self.volumes.lock().await;
        let runtime = volumes
            .entry(volume_id.to_string())
            .or_insert_with(VolumeRuntime::new);
        Self::sync_mount_truth(runtime, volume_id)?;
        self.load_volume(runtime, volume_id).await
    }

    async fn mount(
        &self,
        volume_id: &str,
        target: Option<&Path>,
        read_only: bool,
        options: Option<&str>,
    ) -> Result<PathBuf> {
        if self.directory_mode {
            return Err(Error::NbdUnavailable);
        }

        let mut volumes = self.volumes.lock().await;
        let runtime = volumes
            .entry(volume_id.to_string())
            .or_insert_with(VolumeRuntime::new);
        Self::sync_mount_truth(runtime, volume_id)?;

        if runtime.mounted {
            if let Some(path) = runtime.mount_path.clone() {
                return Ok(path);
            }
        }

        self.load_volume(runtime, volume_id).await?;
        let open = runtime
            .open
            .clone()
            .ok_or_else(|| Error::VolumeNotFound {
                id: volume_id.to_string(),
            })?;
        let filesystem = open
            .info()
            .filesystem
            .parse::<Filesystem>()
            .map_err(|_| Error::UnsupportedFilesystem {
                id: volume_id.to_string(),
                name: open.info().filesystem.clone(),
            })?;

        let device_path = self.attach_nbd(runtime, volume_id, &open).await?;

        if let Err(e) = format::ensure_filesystem(&device_path, filesystem).await {
            for cleanup in self.detach_nbd(runtime, volume_id).await {
                warn!(volume_id = %volume_id, error = %cleanup, "teardown after filesystem failure");
            }
            return Err(e);
        }

        let target = target.map_or_else(|| self.config.mount_path(volume_id), Path::to_path_buf);
        tokio::fs::create_dir_all(&target).await?;

        if let Err(e) = mount::mount_device(&device_path, &target, filesystem, options, read_only) {
            for cleanup in self.detach_nbd(runtime, volume_id).await {
                warn!(volume_id = %volume_id, error = %cleanup, "teardown after mount failure");
            }
            return Err(e);
        }

        runtime.mounted = true;
        runtime.mount_path = Some(target.clone());
        info!(
            volume_id = %volume_id,
            mount_path = %target.display(),
            options = %mount::effective_options(options, read_only),
            "volume mounted"
        );
        Ok(target)
    }

    async fn unmount(&self, volume_id: &str) -> Result<()> {
        let mut volumes = self.volumes.lock().await;
        let Some(runtime) = volumes.get_mut(volume_id) else {
            return Ok(());
        };
        Self::sync_mount_truth(runtime, volume_id)?;

        if runtime.mounted {
            if let Some(path) = runtime.mount_path.clone() {
                mount::unmount_path(&path, false)?;
            }
            runtime.mounted = false;
            runtime.mount_path = None;
            info!(volume_id = %volume_id, "volume unmounted");
        }

        for e in self.detach_nbd(runtime, volume_id).await {
            warn!(volume_id = %volume_id, error = %e, "NBD teardown during unmount");
        }
        Ok(())
    }

    async fn is_mounted(&self, volume_id: &str) -> Result<bool> {
        let mut volumes = self.volumes.lock().await;
        let Some(runtime) = volumes.get_mut(volume_id) else {
            return Ok(false);
        };
        Self::sync_mount_truth(runtime, volume_id)?;
        Ok(runtime.mounted)
    }

    async fn get_info(&self, volume_id: &str) -> Result<VolumeInfo> {
        let mut volumes = self.volumes.lock().await;

        let stored = match self.segments.volume_info(volume_id).await {
            Ok(info) => Some(info),
            Err(miren_segment::Error::VolumeNotFound { .. }) => None,
            Err(e) => return Err(e.into()),
        };

        // Runtime state without backing segments means the volume vanished
        // under us; report it as gone either way.
        let Some(stored) = stored else {
            return Err(Error::VolumeNotFound {
                id: volume_id.to_string(),
            });
        };
        let runtime = volumes.get_mut(volume_id);

        let filesystem = stored
            .filesystem
            .parse::<Filesystem>()
            .map_err(|_| Error::UnsupportedFilesystem {
                id: volume_id.to_string(),
                name: stored.filesystem.clone(),
            })?;

        let (status, mount_path, nbd_index) = match runtime {
            Some(runtime) => {
                Self::sync_mount_truth(runtime, volume_id)?;
                (runtime.status(), runtime.mount_path.clone(), runtime.nbd_index)
            }
            None => (VolumeStatus::OnDisk, None, None),
        };

        Ok(VolumeInfo {
            id: stored.id,
            size_bytes: stored.size_bytes,
            filesystem,
            uuid: stored.uuid,
            status,
            mount_path,
            nbd_index,
        })
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        let mut volumes = self.volumes.lock().await;
        let mut out = Vec::new();

        for stored in self.segments.list_volumes().await? {
            let Ok(filesystem) = stored.filesystem.parse::<Filesystem>() else {
                warn!(volume_id = %stored.id, filesystem = %stored.filesystem, "skipping volume with unknown filesystem");
                continue;
            };
            let (status, mount_path, nbd_index) = match volumes.get_mut(&stored.id) {
                Some(runtime) => {
                    Self::sync_mount_truth(runtime, &stored.id)?;
                    (runtime.status(), runtime.mount_path.clone(), runtime.nbd_index)
                }
                None => (VolumeStatus::OnDisk, None, None),
            };
            out.push(VolumeInfo {
                id: stored.id,
                size_bytes: stored.size_bytes,
                filesystem,
                uuid: stored.uuid,
                status,
                mount_path,
                nbd_index,
            });
        }
        Ok(out)
    }

    async fn unprovision(&self, volume_id: &str) -> Result<()> {
        let mut volumes = self.volumes.lock().await;

        if let Some(mut runtime) = volumes.remove(volume_id) {
            Self::sync_mount_truth(&mut runtime, volume_id)?;
            if runtime.mounted {
                if let Some(path) = runtime.mount_path.clone() {
                    if let Err(e) = mount::unmount_path(&path, true) {
                        warn!(volume_id = %volume_id, error = %e, "force unmount during unprovision");
                    }
                }
            }
            for e in self.detach_nbd(&mut runtime, volume_id).await {
                warn!(volume_id = %volume_id, error = %e, "NBD teardown during unprovision");
            }
        }

        if let Err(e) = clear_nbd_index(&self.config.volume_dir(volume_id)).await {
            warn!(volume_id = %volume_id, error = %e, "clearing nbd-index during unprovision");
        }

        // The backing store has no segment deletion yet; the data stays.
        info!(volume_id = %volume_id, "volume unprovisioned, backing segments retained");
        Ok(())
    }

    async fn acquire_volume_lease(
        &self,
        volume_id: &str,
        node_id: &str,
        app_id: &str,
    ) -> Result<String> {
        let grant = self.segments.acquire_lease(volume_id, node_id, app_id).await?;
        Ok(grant.nonce)
    }

    async fn release_volume_lease(&self, volume_id: &str, nonce: &str) -> Result<()> {
        self.segments.release_lease(volume_id, nonce).await?;
        Ok(())
    }

    fn directory_mode(&self) -> bool {
        self.directory_mode
    }

    async fn ensure_data_dir(&self, volume_id: &str) -> Result<PathBuf> {
        let dir = self.config.data_dir(volume_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn data_dir_exists(&self, volume_id: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.config.data_dir(volume_id)).await?)
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();

        let mut volumes = self.volumes.lock().await;
        let mut errors = Vec::new();

        for (volume_id, mut runtime) in volumes.drain() {
            if let Err(e) = Self::sync_mount_truth(&mut runtime, &volume_id) {
                errors.push(format!("mount truth for {volume_id}: {e}"));
            }
            if runtime.mounted {
                if let Some(path) = runtime.mount_path.clone() {
                    if let Err(e) = mount::unmount_path(&path, true) {
                        errors.push(format!("force unmount {volume_id}: {e}"));
                    }
                }
            }
            errors.extend(self.detach_nbd(&mut runtime, &volume_id).await);
        }

        if errors.is_empty() {
            info!("volume store closed");
            Ok(())
        } else {
            Err(Error::Shutdown { errors })
        }
    }
}
