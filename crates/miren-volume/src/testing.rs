//! In-memory test doubles for the volume runtime.
//!
//! [`MockNbd`] stands in for the kernel loopback facility; [`MockVolumeStore`]
//! implements the full [`VolumeStore`] capability set without touching the
//! kernel, and records every side-effecting call so tests can assert
//! idempotence.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use miren_segment::OpenVolume;

use crate::error::{Error, Result};
use crate::nbd::{NbdLoopback, NbdStatus, ServeEnded};
use crate::store::VolumeStore;
use crate::types::{Filesystem, VolumeInfo, VolumeStatus, GIB};

// ---------------------------------------------------------------------------
// MockNbd

/// A scripted serve outcome for [`MockNbd`].
#[derive(Debug, Clone)]
enum ServeStep {
    Error(String),
    Eof,
}

#[derive(Default)]
struct MockNbdState {
    devices: HashMap<u32, bool>,
    next_index: u32,
    serve_script: VecDeque<ServeStep>,
    serve_sessions: u32,
}

/// An in-memory NBD loopback backend.
///
/// Devices report connected immediately after acquisition. `serve` consumes
/// a script of session outcomes; once the script is exhausted, sessions park
/// until cancelled, which is what a healthy transport looks like.
pub struct MockNbd {
    available: bool,
    state: Mutex<MockNbdState>,
}

impl MockNbd {
    /// A backend whose kernel has NBD.
    #[must_use]
    pub fn new() -> Self {
        Self {
            available: true,
            state: Mutex::new(MockNbdState::default()),
        }
    }

    /// A backend whose kernel lacks NBD entirely.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            available: false,
            state: Mutex::new(MockNbdState::default()),
        }
    }

    /// Marks a device disconnected, as if the kernel lost it.
    pub fn disconnect(&self, index: u32) {
        if let Some(connected) = self.state.lock().devices.get_mut(&index) {
            *connected = false;
        }
    }

    /// Queues a serve session that fails with a transport error.
    pub fn script_serve_error(&self, message: impl Into<String>) {
        self.state
            .lock()
            .serve_script
            .push_back(ServeStep::Error(message.into()));
    }

    /// Queues a serve session that ends with a clean EOF.
    pub fn script_serve_eof(&self) {
        self.state.lock().serve_script.push_back(ServeStep::Eof);
    }

    /// How many serve sessions have started.
    #[must_use]
    pub fn serve_sessions(&self) -> u32 {
        self.state.lock().serve_sessions
    }

    /// The currently acquired device indices.
    #[must_use]
    pub fn acquired_indices(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.state.lock().devices.keys().copied().collect();
        indices.sort_unstable();
        indices
    }
}

impl Default for MockNbd {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NbdLoopback for MockNbd {
    fn available(&self) -> bool {
        self.available
    }

    async fn acquire(&self, _size_bytes: u64, preferred_index: Option<u32>) -> Result<u32> {
        if !self.available {
            return Err(Error::NbdUnavailable);
        }

        let mut state = self.state.lock();
        let index = match preferred_index {
            Some(preferred) if !state.devices.contains_key(&preferred) => preferred,
            _ => {
                while state.devices.contains_key(&state.next_index) {
                    state.next_index += 1;
                }
                state.next_index
            }
        };
        state.devices.insert(index, true);
        Ok(index)
    }

    async fn status(&self, index: u32) -> Result<NbdStatus> {
        let connected = self
            .state
            .lock()
            .devices
            .get(&index)
            .copied()
            .unwrap_or(false);
        Ok(NbdStatus { connected })
    }

    async fn serve(
        &self,
        _index: u32,
        _volume: OpenVolume,
        shutdown: CancellationToken,
    ) -> Result<ServeEnded> {
        let step = {
            let mut state = self.state.lock();
            state.serve_sessions += 1;
            state.serve_script.pop_front()
        };

        match step {
            Some(ServeStep::Error(message)) => Err(Error::Io(std::io::Error::other(message))),
            Some(ServeStep::Eof) => Ok(ServeEnded::Eof),
            None => {
                shutdown.cancelled().await;
                Ok(ServeEnded::Cancelled)
            }
        }
    }

    async fn release(&self, index: u32) -> Result<()> {
        self.state.lock().devices.remove(&index);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockVolumeStore

#[derive(Debug, Clone)]
struct MockVolume {
    size_gib: u64,
    filesystem: Filesystem,
    uuid: Uuid,
    loaded: bool,
    mount_path: Option<PathBuf>,
}

#[derive(Default)]
struct MockVolumeState {
    volumes: HashMap<String, MockVolume>,
    leases: HashMap<String, (String, String, String)>,
    data_dirs: HashSet<String>,
    calls: Vec<String>,
    fail_initialize: Option<String>,
    fail_mount: Option<String>,
    fail_acquire_lease: bool,
}

/// An in-memory [`VolumeStore`].
///
/// Every side-effecting operation appends a `"<op>:<volume-id>"` record to a
/// call log, which is how tests assert that a redelivered reconcile performed
/// no new side effects.
pub struct MockVolumeStore {
    directory_mode: bool,
    mount_base: PathBuf,
    state: Mutex<MockVolumeState>,
}

impl MockVolumeStore {
    /// A store behaving as if NBD is present.
    #[must_use]
    pub fn new() -> Self {
        Self {
            directory_mode: false,
            mount_base: PathBuf::from("/var/lib/miren/disks"),
            state: Mutex::new(MockVolumeState::default()),
        }
    }

    /// A store in directory mode.
    #[must_use]
    pub fn directory() -> Self {
        Self {
            directory_mode: true,
            ..Self::new()
        }
    }

    /// Makes the next and all following `initialize_disk` calls fail.
    pub fn fail_initialize(&self, message: impl Into<String>) {
        self.state.lock().fail_initialize = Some(message.into());
    }

    /// Makes the next and all following `mount` calls fail.
    pub fn fail_mount(&self, message: impl Into<String>) {
        self.state.lock().fail_mount = Some(message.into());
    }

    /// Makes lease acquisition fail.
    pub fn fail_acquire_lease(&self) {
        self.state.lock().fail_acquire_lease = true;
    }

    /// Clears injected failures.
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.fail_initialize = None;
        state.fail_mount = None;
        state.fail_acquire_lease = false;
    }

    /// The recorded side-effecting calls, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// How many times `op` ran against `volume_id`.
    #[must_use]
    pub fn call_count(&self, op: &str, volume_id: &str) -> usize {
        let needle = format!("{op}:{volume_id}");
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| **c == needle)
            .count()
    }

    /// The lease nonce currently held for a volume, if any.
    #[must_use]
    pub fn lease_nonce(&self, volume_id: &str) -> Option<String> {
        self.state
            .lock()
            .leases
            .get(volume_id)
            .map(|(nonce, _, _)| nonce.clone())
    }

    fn record(state: &mut MockVolumeState, op: &str, volume_id: &str) {
        state.calls.push(format!("{op}:{volume_id}"));
    }
}

impl Default for MockVolumeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VolumeStore for MockVolumeStore {
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

        let mut state = self.state.lock();
        Self::record(&mut state, "ensure", volume_id);
        state
            .volumes
            .entry(volume_id.to_string())
            .or_insert_with(|| MockVolume {
                size_gib,
                filesystem,
                uuid: Uuid::new_v4(),
                loaded: false,
                mount_path: None,
            });
        Ok(())
    }

    async fn initialize_disk(&self, volume_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(message) = state.fail_initialize.clone() {
            return Err(Error::Io(std::io::Error::other(message)));
        }
        Self::record(&mut state, "initialize", volume_id);
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| Error::VolumeNotFound {
                id: volume_id.to_string(),
            })?;
        volume.loaded = true;
        Ok(())
    }

    async fn mount(
        &self,
        volume_id: &str,
        target: Option<&Path>,
        _read_only: bool,
        _options: Option<&str>,
    ) -> Result<PathBuf> {
        let mut state = self.state.lock();
        if let Some(message) = state.fail_mount.clone() {
            return Err(Error::Io(std::io::Error::other(message)));
        }

        let path =
            target.map_or_else(|| self.mount_base.join(volume_id), Path::to_path_buf);
        Self::record(&mut state, "mount", volume_id);
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| Error::VolumeNotFound {
                id: volume_id.to_string(),
            })?;
        volume.loaded = true;
        volume.mount_path = Some(path.clone());
        Ok(path)
    }

    async fn unmount(&self, volume_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        Self::record(&mut state, "unmount", volume_id);
        if let Some(volume) = state.volumes.get_mut(volume_id) {
            volume.mount_path = None;
        }
        Ok(())
    }

    async fn is_mounted(&self, volume_id: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .volumes
            .get(volume_id)
            .is_some_and(|v| v.mount_path.is_some()))
    }

    async fn get_info(&self, volume_id: &str) -> Result<VolumeInfo> {
        let state = self.state.lock();
        let volume = state
            .volumes
            .get(volume_id)
            .ok_or_else(|| Error::VolumeNotFound {
                id: volume_id.to_string(),
            })?;

        let status = if volume.mount_path.is_some() {
            VolumeStatus::Mounted
        } else if volume.loaded {
            VolumeStatus::Loaded
        } else {
            VolumeStatus::OnDisk
        };
        Ok(VolumeInfo {
            id: volume_id.to_string(),
            size_bytes: volume.size_gib * GIB,
            filesystem: volume.filesystem,
            uuid: volume.uuid,
            status,
            mount_path: volume.mount_path.clone(),
            nbd_index: None,
        })
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        let ids: Vec<String> = self.state.lock().volumes.keys().cloned().collect();
        let mut out = Vec::new();
        for id in ids {
            out.push(self.get_info(&id).await?);
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn unprovision(&self, volume_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        Self::record(&mut state, "unprovision", volume_id);
        if let Some(volume) = state.volumes.get_mut(volume_id) {
            volume.loaded = false;
            volume.mount_path = None;
        }
        Ok(())
    }

    async fn acquire_volume_lease(
        &self,
        volume_id: &str,
        node_id: &str,
        app_id: &str,
    ) -> Result<String> {
        let mut state = self.state.lock();
        if state.fail_acquire_lease {
            return Err(Error::Segment(miren_segment::Error::Api {
                status: 503,
                message: "lease backend unavailable".to_string(),
            }));
        }
        Self::record(&mut state, "acquire-lease", volume_id);

        if let Some((nonce, node, app)) = state.leases.get(volume_id) {
            if node == node_id && app == app_id {
                return Ok(nonce.clone());
            }
            return Err(Error::Segment(miren_segment::Error::LeaseHeld {
                id: volume_id.to_string(),
                node_id: node.clone(),
                app_id: app.clone(),
            }));
        }

        let nonce = Uuid::new_v4().to_string();
        state.leases.insert(
            volume_id.to_string(),
            (nonce.clone(), node_id.to_string(), app_id.to_string()),
        );
        Ok(nonce)
    }

    async fn release_volume_lease(&self, volume_id: &str, nonce: &str) -> Result<()> {
        let mut state = self.state.lock();
        Self::record(&mut state, "release-lease", volume_id);
        match state.leases.get(volume_id) {
            Some((held, _, _)) if held == nonce => {
                state.leases.remove(volume_id);
                Ok(())
            }
            Some(_) => Err(Error::Segment(miren_segment::Error::LeaseNonceMismatch {
                id: volume_id.to_string(),
            })),
            None => Ok(()),
        }
    }

    fn directory_mode(&self) -> bool {
        self.directory_mode
    }

    async fn ensure_data_dir(&self, volume_id: &str) -> Result<PathBuf> {
        let mut state = self.state.lock();
        Self::record(&mut state, "ensure-data-dir", volume_id);
        state.data_dirs.insert(volume_id.to_string());
        Ok(self.mount_base.join("disk-data").join(volume_id))
    }

    async fn data_dir_exists(&self, volume_id: &str) -> Result<bool> {
        Ok(self.state.lock().data_dirs.contains(volume_id))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        let ids: Vec<String> = state.volumes.keys().cloned().collect();
        for id in ids {
            Self::record(&mut state, "close", &id);
            if let Some(volume) = state.volumes.get_mut(&id) {
                volume.mount_path = None;
                volume.loaded = false;
            }
        }
        Ok(())
    }
}
