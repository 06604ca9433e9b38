//! Replica-writer composition and background replica reconciliation.
//!
//! When a node is configured with a remote endpoint, writes go through a
//! [`ReplicaWriter`]: the local primary must accept the write, the remote
//! replica is written best-effort, and a background [`ReplicaReconciler`]
//! sweeps the difference so the replica eventually converges. Replication
//! never blocks the mount/bind path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::SegmentStore;
use crate::types::{LeaseGrant, ReplicaReport, SegmentVolumeInfo, VolumeSpec};

/// Default interval between replica sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A segment store that writes to a local primary and mirrors to a replica.
///
/// Reads always come from the primary. Volume leases are delegated to the
/// replica, which is the remote side and therefore the authority for
/// cross-node exclusivity.
pub struct ReplicaWriter {
    primary: Arc<dyn SegmentStore>,
    replica: Arc<dyn SegmentStore>,
}

impl ReplicaWriter {
    /// Composes a primary store with its replica.
    #[must_use]
    pub fn new(primary: Arc<dyn SegmentStore>, replica: Arc<dyn SegmentStore>) -> Self {
        Self { primary, replica }
    }

    /// The local primary store.
    #[must_use]
    pub fn primary(&self) -> &Arc<dyn SegmentStore> {
        &self.primary
    }

    /// The remote replica store.
    #[must_use]
    pub fn replica(&self) -> &Arc<dyn SegmentStore> {
        &self.replica
    }
}

#[async_trait]
impl SegmentStore for ReplicaWriter {
    async fn init_container(&self) -> Result<()> {
        self.primary.init_container().await?;
        if let Err(e) = self.replica.init_container().await {
            warn!(error = %e, "replica container init failed, continuing with primary");
        }
        Ok(())
    }

    async fn init_volume(&self, spec: &VolumeSpec) -> Result<SegmentVolumeInfo> {
        let info = self.primary.init_volume(spec).await?;
        if let Err(e) = self.replica.init_volume(spec).await {
            warn!(volume_id = %spec.id, error = %e, "replica volume init failed, sweep will retry");
        }
        Ok(info)
    }

    async fn volume_info(&self, volume_id: &str) -> Result<SegmentVolumeInfo> {
        self.primary.volume_info(volume_id).await
    }

    async fn list_volumes(&self) -> Result<Vec<SegmentVolumeInfo>> {
        self.primary.list_volumes().await
    }

    async fn list_segments(&self, volume_id: &str) -> Result<Vec<u64>> {
        self.primary.list_segments(volume_id).await
    }

    async fn read_segment(&self, volume_id: &str, index: u64) -> Result<Option<Vec<u8>>> {
        self.primary.read_segment(volume_id, index).await
    }

    async fn write_segment(&self, volume_id: &str, index: u64, data: Vec<u8>) -> Result<()> {
        self.primary
            .write_segment(volume_id, index, data.clone())
            .await?;
        if let Err(e) = self.replica.write_segment(volume_id, index, data).await {
            warn!(
                volume_id = %volume_id,
                segment = index,
                error = %e,
                "replica segment write failed, sweep will retry"
            );
        }
        Ok(())
    }

    async fn acquire_lease(
        &self,
        volume_id: &str,
        node_id: &str,
        app_id: &str,
    ) -> Result<LeaseGrant> {
        self.replica.acquire_lease(volume_id, node_id, app_id).await
    }

    async fn release_lease(&self, volume_id: &str, nonce: &str) -> Result<()> {
        self.replica.release_lease(volume_id, nonce).await
    }
}

/// Background task that converges a replica onto its primary.
pub struct ReplicaReconciler {
    primary: Arc<dyn SegmentStore>,
    replica: Arc<dyn SegmentStore>,
    interval: Duration,
    last_report: Arc<RwLock<Option<ReplicaReport>>>,
}

impl ReplicaReconciler {
    /// Creates a reconciler over a primary/replica pair.
    #[must_use]
    pub fn new(primary: Arc<dyn SegmentStore>, replica: Arc<dyn SegmentStore>) -> Self {
        Self {
            primary,
            replica,
            interval: DEFAULT_SWEEP_INTERVAL,
            last_report: Arc::new(RwLock::new(None)),
        }
    }

    /// Overrides the sweep interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// The report from the most recent sweep, if one has completed.
    #[must_use]
    pub fn last_report(&self) -> Option<ReplicaReport> {
        *self.last_report.read()
    }

    /// Runs a single sweep: every segment present on the primary but absent
    /// from the replica is uploaded.
    pub async fn reconcile_once(&self) -> Result<ReplicaReport> {
        let mut report = ReplicaReport::default();

        for volume in self.primary.list_volumes().await? {
            let spec = VolumeSpec {
                id: volume.id.clone(),
                name: volume.name.clone(),
                size_bytes: volume.size_bytes,
                filesystem: volume.filesystem.clone(),
                uuid: volume.uuid,
            };
            if let Err(e) = self.replica.init_volume(&spec).await {
                warn!(volume_id = %volume.id, error = %e, "replica volume ensure failed, skipping volume");
                continue;
            }

            let primary_segments = self.primary.list_segments(&volume.id).await?;
            let replica_segments = match self.replica.list_segments(&volume.id).await {
                Ok(segments) => segments,
                Err(e) => {
                    warn!(volume_id = %volume.id, error = %e, "replica segment listing failed, skipping volume");
                    continue;
                }
            };

            report.total_primary += primary_segments.len();
            report.total_replica += replica_segments.len();

            for index in &primary_segments {
                if replica_segments.binary_search(index).is_ok() {
                    continue;
                }
                report.missing += 1;

                let Some(data) = self.primary.read_segment(&volume.id, *index).await? else {
                    // Deleted between listing and read; nothing to upload.
                    continue;
                };
                match self.replica.write_segment(&volume.id, *index, data).await {
                    Ok(()) => report.uploaded += 1,
                    Err(e) => {
                        report.failed += 1;
                        warn!(volume_id = %volume.id, segment = index, error = %e, "segment upload failed");
                    }
                }
            }
        }

        info!(
            total_primary = report.total_primary,
            total_replica = report.total_replica,
            missing = report.missing,
            uploaded = report.uploaded,
            failed = report.failed,
            "replica sweep finished"
        );
        *self.last_report.write() = Some(report);
        Ok(report)
    }

    /// Spawns the sweep loop. It runs until `shutdown` is cancelled.
    #[must_use]
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        debug!("replica reconciler stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.reconcile_once().await {
                            warn!(error = %e, "replica sweep failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalSegmentStore;
    use crate::types::SEGMENT_SIZE;

    async fn pair() -> (
        tempfile::TempDir,
        Arc<dyn SegmentStore>,
        Arc<dyn SegmentStore>,
    ) {
        let dir = tempfile::tempdir().expect("tempdir");
        let primary = Arc::new(LocalSegmentStore::new(dir.path().join("primary")));
        let replica = Arc::new(LocalSegmentStore::new(dir.path().join("replica")));
        primary.init_container().await.expect("init primary");
        replica.init_container().await.expect("init replica");
        (dir, primary, replica)
    }

    #[tokio::test]
    async fn writes_mirror_to_replica() {
        let (_dir, primary, replica) = pair().await;
        let writer = ReplicaWriter::new(Arc::clone(&primary), Arc::clone(&replica));

        writer
            .init_volume(&VolumeSpec::new("v-1", "scratch", 4 * SEGMENT_SIZE))
            .await
            .expect("init");
        writer
            .write_segment("v-1", 0, vec![5u8; 512])
            .await
            .expect("write");

        assert_eq!(
            primary.read_segment("v-1", 0).await.expect("read"),
            Some(vec![5u8; 512])
        );
        assert_eq!(
            replica.read_segment("v-1", 0).await.expect("read"),
            Some(vec![5u8; 512])
        );
    }

    #[tokio::test]
    async fn sweep_uploads_missing_segments() {
        let (_dir, primary, replica) = pair().await;

        // Segments written to the primary only, as if the replica had been
        // unreachable at write time.
        primary
            .init_volume(&VolumeSpec::new("v-1", "scratch", 4 * SEGMENT_SIZE))
            .await
            .expect("init");
        primary
            .write_segment("v-1", 0, vec![1u8; 128])
            .await
            .expect("write");
        primary
            .write_segment("v-1", 2, vec![2u8; 128])
            .await
            .expect("write");

        let reconciler = ReplicaReconciler::new(Arc::clone(&primary), Arc::clone(&replica));
        let report = reconciler.reconcile_once().await.expect("sweep");

        assert_eq!(report.total_primary, 2);
        assert_eq!(report.total_replica, 0);
        assert_eq!(report.missing, 2);
        assert_eq!(report.uploaded, 2);
        assert_eq!(report.failed, 0);

        assert_eq!(
            replica.read_segment("v-1", 2).await.expect("read"),
            Some(vec![2u8; 128])
        );
        assert_eq!(reconciler.last_report(), Some(report));
    }

    #[tokio::test]
    async fn sweep_converges_to_no_missing() {
        let (_dir, primary, replica) = pair().await;
        primary
            .init_volume(&VolumeSpec::new("v-1", "scratch", 4 * SEGMENT_SIZE))
            .await
            .expect("init");
        primary
            .write_segment("v-1", 1, vec![3u8; 64])
            .await
            .expect("write");

        let reconciler = ReplicaReconciler::new(Arc::clone(&primary), Arc::clone(&replica));
        reconciler.reconcile_once().await.expect("first sweep");
        let report = reconciler.reconcile_once().await.expect("second sweep");

        assert_eq!(report.missing, 0);
        assert_eq!(report.uploaded, 0);
        assert_eq!(report.total_replica, 1);
    }

    #[tokio::test]
    async fn spawned_loop_stops_on_cancel() {
        let (_dir, primary, replica) = pair().await;
        let reconciler = ReplicaReconciler::new(primary, replica)
            .with_interval(Duration::from_millis(10));

        let shutdown = CancellationToken::new();
        let handle = reconciler.spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should stop")
            .expect("loop should not panic");
    }
}
