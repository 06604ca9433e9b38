//! The disk watcher: fans disk changes out to the leases referencing them.
//!
//! A PENDING lease whose disk is still PROVISIONING parks without polling;
//! this watcher is the reverse edge that wakes it. There is no back-pointer
//! from disks to leases; the watcher lists leases by the `disk-id` index on
//! every disk event instead.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use miren_entity::{EntityChange, EntityId, EntityKind, EntityStore};

use crate::error::Result;
use crate::types::{ATTR_DISK_ID, ATTR_STATUS};

/// Bridges disk changes to lease reconciliation.
pub struct DiskWatcher {
    entities: Arc<dyn EntityStore>,
    queue: mpsc::UnboundedSender<EntityId>,
}

impl DiskWatcher {
    /// Creates a watcher feeding the given lease work queue.
    #[must_use]
    pub fn new(entities: Arc<dyn EntityStore>, queue: mpsc::UnboundedSender<EntityId>) -> Self {
        Self { entities, queue }
    }

    /// Enqueues every lease referencing `disk_id`. Returns how many were
    /// enqueued.
    pub async fn fan_out(&self, disk_id: &EntityId) -> Result<usize> {
        let leases = self
            .entities
            .list_where(
                EntityKind::DiskLease,
                ATTR_DISK_ID,
                &Value::from(disk_id.as_str()),
            )
            .await?;

        let mut enqueued = 0;
        for lease in leases {
            if self.queue.send(lease.id).is_ok() {
                enqueued += 1;
            }
        }
        if enqueued > 0 {
            debug!(disk_id = %disk_id, count = enqueued, "disk change fanned out to leases");
        }
        Ok(enqueued)
    }

    /// Enqueues every PENDING lease; the recovery path when the change feed
    /// lagged and events were dropped.
    async fn full_pass(&self) -> Result<usize> {
        let mut enqueued = 0;
        for lease in self.entities.list(EntityKind::DiskLease).await? {
            if lease.get_str(ATTR_STATUS) == Some("PENDING") && self.queue.send(lease.id).is_ok() {
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    /// Runs the watch loop until `shutdown` is cancelled.
    ///
    /// The feed subscription is taken before the task starts, so no disk
    /// event between spawn and first poll can slip by.
    #[must_use]
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut feed = self.entities.watch(EntityKind::Disk);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    event = feed.recv() => match event {
                        Ok(EntityChange { id, .. }) => {
                            if let Err(e) = self.fan_out(&id).await {
                                warn!(disk_id = %id, error = %e, "disk fan-out failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "disk change feed lagged, running full pass");
                            if let Err(e) = self.full_pass().await {
                                warn!(error = %e, "full pass after lag failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        })
    }
}
