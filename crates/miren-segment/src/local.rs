//! File-backed segment store.
//!
//! Volumes live under `<root>/<volume-id>/` with a `volume.json` metadata
//! file, a `lease.json` exclusivity grant, and a `segments/` directory of
//! numbered segment files. The layout is restart-safe: everything the store
//! knows is on disk.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::SegmentStore;
use crate::types::{LeaseGrant, SegmentVolumeInfo, VolumeSpec, SEGMENT_SIZE};

const VOLUME_META_FILE: &str = "volume.json";
const LEASE_FILE: &str = "lease.json";
const SEGMENTS_DIR: &str = "segments";

/// A segment store over a local directory tree.
#[derive(Debug, Clone)]
pub struct LocalSegmentStore {
    root: PathBuf,
}

impl LocalSegmentStore {
    /// Creates a store rooted at `root`. Nothing is touched until
    /// [`SegmentStore::init_container`] runs.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory holding a volume's metadata and segments.
    #[must_use]
    pub fn volume_dir(&self, volume_id: &str) -> PathBuf {
        self.root.join(volume_id)
    }

    fn check_id(volume_id: &str) -> Result<()> {
        if volume_id.is_empty() {
            return Err(Error::InvalidVolumeId {
                reason: "volume id cannot be empty".to_string(),
            });
        }
        if volume_id.contains(['/', '\\']) || volume_id == "." || volume_id == ".." {
            return Err(Error::InvalidVolumeId {
                reason: format!("volume id '{volume_id}' is not a valid directory name"),
            });
        }
        Ok(())
    }

    fn segment_path(&self, volume_id: &str, index: u64) -> PathBuf {
        self.volume_dir(volume_id)
            .join(SEGMENTS_DIR)
            .join(format!("{index:08}.seg"))
    }

    async fn read_meta(&self, volume_id: &str) -> Result<SegmentVolumeInfo> {
        let path = self.volume_dir(volume_id).join(VOLUME_META_FILE);
        match fs::read(&path).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::VolumeNotFound {
                id: volume_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_lease(&self, volume_id: &str) -> Result<Option<LeaseGrant>> {
        let path = self.volume_dir(volume_id).join(LEASE_FILE);
        match fs::read(&path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SegmentStore for LocalSegmentStore {
    async fn init_container(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn init_volume(&self, spec: &VolumeSpec) -> Result<SegmentVolumeInfo> {
        Self::check_id(&spec.id)?;
        if spec.size_bytes == 0 {
            return Err(Error::InvalidVolumeSpec {
                reason: "volume size cannot be zero".to_string(),
            });
        }

        match self.read_meta(&spec.id).await {
            Ok(existing) => {
                if existing.size_bytes != spec.size_bytes {
                    warn!(
                        volume_id = %spec.id,
                        existing_bytes = existing.size_bytes,
                        requested_bytes = spec.size_bytes,
                        "volume exists with a different size, reusing existing volume"
                    );
                }
                return Ok(existing);
            }
            Err(Error::VolumeNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let dir = self.volume_dir(&spec.id);
        fs::create_dir_all(dir.join(SEGMENTS_DIR)).await?;

        let info = SegmentVolumeInfo::from_spec(spec);
        fs::write(dir.join(VOLUME_META_FILE), serde_json::to_vec_pretty(&info)?).await?;

        info!(
            volume_id = %spec.id,
            size_bytes = spec.size_bytes,
            filesystem = %spec.filesystem,
            "volume created"
        );
        Ok(info)
    }

    async fn volume_info(&self, volume_id: &str) -> Result<SegmentVolumeInfo> {
        Self::check_id(volume_id)?;
        self.read_meta(volume_id).await
    }

    async fn list_volumes(&self) -> Result<Vec<SegmentVolumeInfo>> {
        let mut volumes = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(volumes),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = name.to_str() else { continue };
            match self.read_meta(id).await {
                Ok(info) => volumes.push(info),
                // A directory without metadata is a half-created volume;
                // skip it rather than fail the whole listing.
                Err(Error::VolumeNotFound { .. }) => {
                    debug!(volume_id = %id, "skipping directory without volume metadata");
                }
                Err(e) => return Err(e),
            }
        }

        volumes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(volumes)
    }

    async fn list_segments(&self, volume_id: &str) -> Result<Vec<u64>> {
        Self::check_id(volume_id)?;
        // Missing volume must surface as such, not as an empty listing.
        self.read_meta(volume_id).await?;

        let mut segments = Vec::new();
        let dir = self.volume_dir(volume_id).join(SEGMENTS_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(segments),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".seg") {
                if let Ok(index) = stem.parse::<u64>() {
                    segments.push(index);
                }
            }
        }

        segments.sort_unstable();
        Ok(segments)
    }

    async fn read_segment(&self, volume_id: &str, index: u64) -> Result<Option<Vec<u8>>> {
        Self::check_id(volume_id)?;
        match fs::read(self.segment_path(volume_id, index)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_segment(&self, volume_id: &str, index: u64, data: Vec<u8>) -> Result<()> {
        Self::check_id(volume_id)?;
        if data.len() as u64 > SEGMENT_SIZE {
            return Err(Error::OutOfBounds {
                offset: 0,
                length: data.len() as u64,
                size_bytes: SEGMENT_SIZE,
            });
        }

        let path = self.segment_path(volume_id, index);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write-then-rename so a crash mid-write never leaves a torn segment.
        let tmp = path.with_extension("seg.tmp");
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn acquire_lease(
        &self,
        volume_id: &str,
        node_id: &str,
        app_id: &str,
    ) -> Result<LeaseGrant> {
        Self::check_id(volume_id)?;
        self.read_meta(volume_id).await?;

        if let Some(existing) = self.read_lease(volume_id).await? {
            if existing.node_id == node_id && existing.app_id == app_id {
                return Ok(existing);
            }
            return Err(Error::LeaseHeld {
                id: volume_id.to_string(),
                node_id: existing.node_id,
                app_id: existing.app_id,
            });
        }

        let grant = LeaseGrant {
            nonce: Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            app_id: app_id.to_string(),
            acquired_at: chrono::Utc::now(),
        };
        fs::write(
            self.volume_dir(volume_id).join(LEASE_FILE),
            serde_json::to_vec_pretty(&grant)?,
        )
        .await?;

        info!(volume_id = %volume_id, node_id = %node_id, app_id = %app_id, "volume lease acquired");
        Ok(grant)
    }

    async fn release_lease(&self, volume_id: &str, nonce: &str) -> Result<()> {
        Self::check_id(volume_id)?;

        let Some(existing) = self.read_lease(volume_id).await? else {
            return Ok(());
        };
        if existing.nonce != nonce {
            return Err(Error::LeaseNonceMismatch {
                id: volume_id.to_string(),
            });
        }

        fs::remove_file(self.volume_dir(volume_id).join(LEASE_FILE)).await?;
        info!(volume_id = %volume_id, "volume lease released");
        Ok(())
    }
}

/// Returns true when `path` looks like an initialized volume directory.
pub async fn is_volume_dir(path: &Path) -> bool {
    fs::try_exists(path.join(VOLUME_META_FILE)).await.unwrap_or(false)
}
