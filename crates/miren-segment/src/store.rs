//! The segment store interface and the loaded volume object.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::types::{LeaseGrant, SegmentVolumeInfo, VolumeSpec, SEGMENT_SIZE};

/// Storage interface over a segment-backed volume container.
///
/// Three flavors exist: local files, the remote disk API, and a
/// replica-writer composition of the two. All operations are idempotent:
/// creating a volume that already exists with the same size is a no-op, and
/// lease acquire/release tolerate redelivery by the same holder.
#[async_trait]
pub trait SegmentStore: Send + Sync + 'static {
    /// Ensures the backing container exists.
    async fn init_container(&self) -> Result<()>;

    /// Creates a volume, or returns the existing one with the same id.
    ///
    /// A size mismatch against an existing volume is not an error; the
    /// existing volume wins and the mismatch is logged.
    async fn init_volume(&self, spec: &VolumeSpec) -> Result<SegmentVolumeInfo>;

    /// Fetches volume metadata.
    async fn volume_info(&self, volume_id: &str) -> Result<SegmentVolumeInfo>;

    /// Lists all volumes in the container.
    async fn list_volumes(&self) -> Result<Vec<SegmentVolumeInfo>>;

    /// Lists the indices of segments that have been written.
    async fn list_segments(&self, volume_id: &str) -> Result<Vec<u64>>;

    /// Reads a whole segment. `None` means the segment was never written.
    async fn read_segment(&self, volume_id: &str, index: u64) -> Result<Option<Vec<u8>>>;

    /// Writes a whole segment.
    async fn write_segment(&self, volume_id: &str, index: u64, data: Vec<u8>) -> Result<()>;

    /// Acquires the volume's exclusivity lease, recording the caller.
    ///
    /// Re-acquiring from the same node and app returns the existing grant.
    async fn acquire_lease(&self, volume_id: &str, node_id: &str, app_id: &str)
        -> Result<LeaseGrant>;

    /// Releases a lease by nonce. Releasing an absent lease is a no-op.
    async fn release_lease(&self, volume_id: &str, nonce: &str) -> Result<()>;
}

/// A volume loaded for I/O.
///
/// This is the in-memory disk object the NBD handler serves: byte-addressed
/// reads and writes mapped onto fixed-size segments in the backing store.
/// Unwritten ranges read as zeroes.
#[derive(Clone)]
pub struct OpenVolume {
    store: Arc<dyn SegmentStore>,
    info: SegmentVolumeInfo,
}

impl OpenVolume {
    /// Attaches a loaded volume object to its backing store.
    #[must_use]
    pub fn new(store: Arc<dyn SegmentStore>, info: SegmentVolumeInfo) -> Self {
        Self { store, info }
    }

    /// The volume's metadata.
    #[must_use]
    pub fn info(&self) -> &SegmentVolumeInfo {
        &self.info
    }

    /// Total volume capacity in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.info.size_bytes
    }

    fn check_bounds(&self, offset: u64, length: usize) -> Result<()> {
        let end = offset.checked_add(length as u64).unwrap_or(u64::MAX);
        if end > self.info.size_bytes {
            return Err(Error::OutOfBounds {
                offset,
                length: length as u64,
                size_bytes: self.info.size_bytes,
            });
        }
        Ok(())
    }

    /// Reads `buf.len()` bytes starting at `offset`.
    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;

        let mut filled = 0usize;
        while filled < buf.len() {
            let pos = offset + filled as u64;
            let segment = pos / SEGMENT_SIZE;
            let within = (pos % SEGMENT_SIZE) as usize;
            let take = ((SEGMENT_SIZE as usize) - within).min(buf.len() - filled);

            match self.store.read_segment(&self.info.id, segment).await? {
                Some(data) => {
                    let window = &mut buf[filled..filled + take];
                    // Short segment files read as zero past their length.
                    for (i, b) in window.iter_mut().enumerate() {
                        *b = data.get(within + i).copied().unwrap_or(0);
                    }
                }
                None => {
                    buf[filled..filled + take].fill(0);
                }
            }
            filled += take;
        }
        Ok(())
    }

    /// Writes `data` starting at `offset`.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_bounds(offset, data.len())?;

        let mut written = 0usize;
        while written < data.len() {
            let pos = offset + written as u64;
            let segment = pos / SEGMENT_SIZE;
            let within = (pos % SEGMENT_SIZE) as usize;
            let take = ((SEGMENT_SIZE as usize) - within).min(data.len() - written);

            let mut buf = self
                .store
                .read_segment(&self.info.id, segment)
                .await?
                .unwrap_or_default();
            if buf.len() < within + take {
                buf.resize(within + take, 0);
            }
            buf[within..within + take].copy_from_slice(&data[written..written + take]);
            self.store.write_segment(&self.info.id, segment, buf).await?;

            written += take;
        }
        Ok(())
    }
}

impl std::fmt::Debug for OpenVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenVolume")
            .field("id", &self.info.id)
            .field("size_bytes", &self.info.size_bytes)
            .finish_non_exhaustive()
    }
}
