//! The lease reconciler: binds sandboxes to disks, exclusively.
//!
//! The single-lessee invariant on this node lives in the `active` map:
//! whichever lease reserves a disk there first wins, and the reservation is
//! taken before any slow I/O. The entity database stays the authority: a
//! BOUND record the controller has never seen (restart) is adopted, and all
//! in-memory state is merely a cache of what the database already says.
//!
//! The mutex discipline is strict: the state lock is held only for map
//! lookups and installs, never across I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use miren_entity::{encode_time, Attrs, Entity, EntityId, EntityKind, EntityStore};
use miren_volume::VolumeStore;

use crate::error::Result;
use crate::reconciler::{Reconciler, VolumeStores};
use crate::types::{
    Disk, DiskLease, DiskStatus, LeaseStatus, ATTR_ACQUIRED_AT, ATTR_ERROR_MESSAGE, ATTR_STATUS,
};

/// How often pending leases are re-enqueued.
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(10);

/// How often released leases are swept.
pub const GC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Released leases older than this are garbage-collected.
pub const GC_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// What the lease reconciler remembers about a bound lease, so teardown
/// does not need a database fetch.
#[derive(Debug, Clone)]
struct LeaseDetails {
    sandbox_id: String,
    volume_id: Option<String>,
    nonce: Option<String>,
    remote_only: bool,
}

#[derive(Default)]
struct LeaseState {
    /// disk-id → lease-id: the single-lessee invariant on this node.
    active: HashMap<EntityId, EntityId>,

    /// lease-id → what Delete needs without a database fetch.
    details: HashMap<EntityId, LeaseDetails>,
}

/// Outcome of the reservation check at the top of a bind.
enum Reservation {
    Taken,
    AlreadyOurs,
    HeldBy(EntityId),
}

/// Converges `DiskLease` records through PENDING → BOUND → RELEASED.
pub struct LeaseReconciler {
    entities: Arc<dyn EntityStore>,
    stores: VolumeStores,
    node_id: String,
    state: Mutex<LeaseState>,
    queue_tx: mpsc::UnboundedSender<EntityId>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<EntityId>>>,
}

impl LeaseReconciler {
    /// Creates a lease reconciler for this node.
    #[must_use]
    pub fn new(entities: Arc<dyn EntityStore>, stores: VolumeStores, node_id: impl Into<String>) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            entities,
            stores,
            node_id: node_id.into(),
            state: Mutex::new(LeaseState::default()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
        })
    }

    /// A handle for enqueueing lease ids to re-reconcile (used by the disk
    /// watcher and the resync loop).
    #[must_use]
    pub fn work_queue(&self) -> mpsc::UnboundedSender<EntityId> {
        self.queue_tx.clone()
    }

    /// The lease currently holding a disk on this node, if any.
    #[must_use]
    pub fn active_lease(&self, disk_id: &EntityId) -> Option<EntityId> {
        self.state.lock().active.get(disk_id).cloned()
    }

    async fn reconcile(&self, entity: &Entity) -> Result<()> {
        let lease = DiskLease::decode(entity)?;
        match lease.status {
            LeaseStatus::Pending => self.bind(&lease).await,
            LeaseStatus::Bound => self.ensure_bound(&lease).await,
            LeaseStatus::Released => self.release(&lease).await,
            LeaseStatus::Failed => Ok(()),
        }
    }

    // -----------------------------------------------------------------
    // PENDING → bind

    async fn bind(&self, lease: &DiskLease) -> Result<()> {
        // Reserve the disk before any slow I/O; the map is the serialization
        // point between competing leases.
        let reservation = {
            let mut state = self.state.lock();
            match state.active.get(&lease.disk_id) {
                Some(holder) if *holder == lease.id => Reservation::AlreadyOurs,
                Some(holder) => Reservation::HeldBy(holder.clone()),
                None => {
                    state
                        .active
                        .insert(lease.disk_id.clone(), lease.id.clone());
                    Reservation::Taken
                }
            }
        };
        match reservation {
            Reservation::Taken => {}
            // A redelivery of a bind already in flight.
            Reservation::AlreadyOurs => return Ok(()),
            Reservation::HeldBy(holder) => {
                let message = format!("disk {} already leased by {holder}", lease.disk_id);
                return self.fail_lease(&lease.id, &message).await;
            }
        }

        let disk_entity = match self.entities.get(&lease.disk_id).await {
            Ok(entity) => entity,
            Err(e) => {
                // Could be an ordering artifact; retry rather than fail.
                self.drop_reservation(&lease.disk_id, &lease.id);
                return Err(e.into());
            }
        };
        let disk = match Disk::decode(&disk_entity) {
            Ok(disk) => disk,
            Err(e) => {
                self.drop_reservation(&lease.disk_id, &lease.id);
                return self
                    .fail_lease(&lease.id, &format!("bad disk record: {e}"))
                    .await;
            }
        };

        match disk.status {
            DiskStatus::Provisioned => {}
            DiskStatus::Provisioning => {
                // Not ready yet; the disk watcher re-enqueues this lease when
                // the disk flips to PROVISIONED.
                debug!(lease_id = %lease.id, disk_id = %lease.disk_id, "disk still provisioning, lease stays pending");
                self.drop_reservation(&lease.disk_id, &lease.id);
                return Ok(());
            }
            other => {
                self.drop_reservation(&lease.disk_id, &lease.id);
                return self
                    .fail_lease(
                        &lease.id,
                        &format!("disk {} is not provisioned (status {other})", lease.disk_id),
                    )
                    .await;
            }
        }

        let Some(volume_id) = disk.volume_id.clone() else {
            self.drop_reservation(&lease.disk_id, &lease.id);
            return self
                .fail_lease(&lease.id, &format!("disk {} has no volume id", lease.disk_id))
                .await;
        };

        let store = match self.stores.for_disk(&disk) {
            Ok(store) => store,
            Err(e) => {
                self.drop_reservation(&lease.disk_id, &lease.id);
                return self.fail_lease(&lease.id, &e.to_string()).await;
            }
        };

        if store.directory_mode() {
            match store.data_dir_exists(&volume_id).await {
                Ok(true) => {}
                Ok(false) => {
                    self.drop_reservation(&lease.disk_id, &lease.id);
                    return self
                        .fail_lease(
                            &lease.id,
                            &format!("data directory for volume {volume_id} is missing"),
                        )
                        .await;
                }
                Err(e) => {
                    self.drop_reservation(&lease.disk_id, &lease.id);
                    return Err(e.into());
                }
            }
        } else if let Err(message) = self
            .setup_volume(&store, lease, &disk, &volume_id, None)
            .await
        {
            self.drop_reservation(&lease.disk_id, &lease.id);
            self.drop_details(&lease.id);
            return self.fail_lease(&lease.id, &message).await;
        }

        // Final install, re-checking the reservation is still ours.
        {
            let mut state = self.state.lock();
            if state.active.get(&lease.disk_id) != Some(&lease.id) {
                warn!(lease_id = %lease.id, disk_id = %lease.disk_id, "reservation lost during bind");
                return Ok(());
            }
            let nonce = state
                .details
                .get(&lease.id)
                .and_then(|d| d.nonce.clone());
            state.details.insert(
                lease.id.clone(),
                LeaseDetails {
                    sandbox_id: lease.sandbox_id.clone(),
                    volume_id: Some(volume_id.clone()),
                    nonce,
                    remote_only: disk.remote_only,
                },
            );
        }

        let mut attrs = Attrs::new();
        attrs.insert(
            ATTR_STATUS.to_string(),
            Value::from(LeaseStatus::Bound.as_str()),
        );
        attrs.insert(ATTR_ERROR_MESSAGE.to_string(), Value::Null);
        attrs.insert(ATTR_ACQUIRED_AT.to_string(), encode_time(Utc::now()));
        self.entities.patch(&lease.id, attrs, None).await?;

        info!(
            lease_id = %lease.id,
            disk_id = %lease.disk_id,
            volume_id = %volume_id,
            sandbox_id = %lease.sandbox_id,
            "lease bound"
        );
        Ok(())
    }

    /// Acquires the exclusivity nonce, initializes, and mounts. Returns a
    /// failure message suitable for the lease record; partial work (the
    /// nonce) is rolled back before returning.
    async fn setup_volume(
        &self,
        store: &Arc<dyn VolumeStore>,
        lease: &DiskLease,
        disk: &Disk,
        volume_id: &str,
        existing_nonce: Option<String>,
    ) -> std::result::Result<(), String> {
        let nonce = match existing_nonce {
            Some(nonce) => nonce,
            None => match store
                .acquire_volume_lease(volume_id, &self.node_id, &lease.app_id)
                .await
            {
                Ok(nonce) => nonce,
                Err(e) => return Err(format!("acquiring volume lease: {e}")),
            },
        };

        // Record the nonce immediately so teardown can release it even if
        // the rest of the bind dies with the process.
        {
            let mut state = self.state.lock();
            state.details.insert(
                lease.id.clone(),
                LeaseDetails {
                    sandbox_id: lease.sandbox_id.clone(),
                    volume_id: Some(volume_id.to_string()),
                    nonce: Some(nonce.clone()),
                    remote_only: disk.remote_only,
                },
            );
        }

        if let Err(e) = store.initialize_disk(volume_id).await {
            self.release_nonce(store, volume_id, &nonce).await;
            return Err(format!("initializing disk: {e}"));
        }

        if let Err(e) = store
            .mount(
                volume_id,
                None,
                lease.mount.read_only,
                lease.mount.options.as_deref(),
            )
            .await
        {
            self.release_nonce(store, volume_id, &nonce).await;
            return Err(format!("mounting volume: {e}"));
        }

        Ok(())
    }

    async fn release_nonce(&self, store: &Arc<dyn VolumeStore>, volume_id: &str, nonce: &str) {
        if let Err(e) = store.release_volume_lease(volume_id, nonce).await {
            warn!(volume_id = %volume_id, error = %e, "releasing volume lease after failed bind");
        }
    }

    // -----------------------------------------------------------------
    // BOUND: idempotent revalidation and restart adoption

    async fn ensure_bound(&self, lease: &DiskLease) -> Result<()> {
        // The database says BOUND; local state may not know it yet (fresh
        // controller). Claim or verify the slot first.
        let (fresh_claim, known) = {
            let mut state = self.state.lock();
            match state.active.get(&lease.disk_id) {
                None => {
                    state
                        .active
                        .insert(lease.disk_id.clone(), lease.id.clone());
                    (true, None)
                }
                Some(holder) if *holder == lease.id => {
                    (false, state.details.get(&lease.id).cloned())
                }
                Some(holder) => {
                    // Two BOUND leases for one disk is a split brain; fail
                    // this one without disturbing the existing holder.
                    let message = format!(
                        "conflict: disk {} is held by {holder}",
                        lease.disk_id
                    );
                    drop(state);
                    return self.fail_with(&lease.id, message).await;
                }
            }
        };

        // Fast path: everything already checks out.
        if !fresh_claim {
            if let Some(details) = &known {
                if let Some(volume_id) = &details.volume_id {
                    if let Ok(store) = self.stores.select(details.remote_only) {
                        let healthy = if store.directory_mode() {
                            store.data_dir_exists(volume_id).await.unwrap_or(false)
                        } else {
                            store.is_mounted(volume_id).await.unwrap_or(false)
                        };
                        if healthy {
                            return Ok(());
                        }
                    }
                }
            }
        }

        // Something is missing; rebuild from the disk record.
        let disk_entity = match self.entities.get(&lease.disk_id).await {
            Ok(entity) => entity,
            // The claim stands (the database says this lease is BOUND) but
            // we cannot make progress; let the scheduler retry.
            Err(e) => return Err(e.into()),
        };
        let disk = match Disk::decode(&disk_entity) {
            Ok(disk) => disk,
            Err(e) => {
                self.abandon(&lease.disk_id, &lease.id);
                return self
                    .fail_lease(&lease.id, &format!("bad disk record: {e}"))
                    .await;
            }
        };
        let Some(volume_id) = disk.volume_id.clone() else {
            self.abandon(&lease.disk_id, &lease.id);
            return self
                .fail_lease(&lease.id, &format!("disk {} has no volume id", lease.disk_id))
                .await;
        };
        let store = match self.stores.for_disk(&disk) {
            Ok(store) => store,
            Err(e) => {
                self.abandon(&lease.disk_id, &lease.id);
                return self.fail_lease(&lease.id, &e.to_string()).await;
            }
        };

        if store.directory_mode() {
            match store.data_dir_exists(&volume_id).await {
                Ok(true) => {
                    self.install_details(lease, &disk, &volume_id, None);
                    return Ok(());
                }
                Ok(false) => {
                    self.abandon(&lease.disk_id, &lease.id);
                    return self
                        .fail_lease(
                            &lease.id,
                            &format!("data directory for volume {volume_id} is missing"),
                        )
                        .await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let existing_nonce = known.as_ref().and_then(|d| d.nonce.clone());
        if let Err(message) = self
            .setup_volume(&store, lease, &disk, &volume_id, existing_nonce)
            .await
        {
            self.abandon(&lease.disk_id, &lease.id);
            return self.fail_lease(&lease.id, &message).await;
        }

        self.install_details(lease, &disk, &volume_id, {
            let state = self.state.lock();
            state.details.get(&lease.id).and_then(|d| d.nonce.clone())
        });
        debug!(lease_id = %lease.id, volume_id = %volume_id, "bound lease revalidated");
        Ok(())
    }

    fn install_details(&self, lease: &DiskLease, disk: &Disk, volume_id: &str, nonce: Option<String>) {
        let mut state = self.state.lock();
        state.details.insert(
            lease.id.clone(),
            LeaseDetails {
                sandbox_id: lease.sandbox_id.clone(),
                volume_id: Some(volume_id.to_string()),
                nonce,
                remote_only: disk.remote_only,
            },
        );
    }

    // -----------------------------------------------------------------
    // RELEASED: teardown

    async fn release(&self, lease: &DiskLease) -> Result<()> {
        let details = {
            let state = self.state.lock();
            if state.active.get(&lease.disk_id) != Some(&lease.id) {
                // Not held locally: either never bound here or already torn
                // down. Redelivery is a no-op.
                return Ok(());
            }
            state.details.get(&lease.id).cloned()
        };

        self.teardown(lease, details.as_ref()).await;

        {
            let mut state = self.state.lock();
            if state.active.get(&lease.disk_id) == Some(&lease.id) {
                state.active.remove(&lease.disk_id);
            }
            state.details.remove(&lease.id);
        }

        let sandbox_id = details
            .map(|d| d.sandbox_id)
            .unwrap_or_else(|| lease.sandbox_id.clone());
        info!(
            lease_id = %lease.id,
            disk_id = %lease.disk_id,
            sandbox_id = %sandbox_id,
            "lease released"
        );
        Ok(())
    }

    /// Unmount and nonce release, all best-effort: teardown never fails the
    /// operation, it only logs.
    async fn teardown(&self, lease: &DiskLease, details: Option<&LeaseDetails>) {
        let (volume_id, remote_only) = match details {
            Some(d) if d.volume_id.is_some() => (d.volume_id.clone(), d.remote_only),
            _ => match self.entities.get(&lease.disk_id).await {
                Ok(entity) => match Disk::decode(&entity) {
                    Ok(disk) => (disk.volume_id, disk.remote_only),
                    Err(_) => (None, false),
                },
                Err(_) => (None, false),
            },
        };
        let Some(volume_id) = volume_id else {
            return;
        };
        let Ok(store) = self.stores.select(remote_only) else {
            return;
        };
        if store.directory_mode() {
            // Nothing was mounted and no nonce was taken.
            return;
        }

        match store.is_mounted(&volume_id).await {
            Ok(true) => {
                if let Err(e) = store.unmount(&volume_id).await {
                    warn!(lease_id = %lease.id, volume_id = %volume_id, error = %e, "unmount during release");
                }
            }
            Ok(false) => {}
            Err(e) => {
                warn!(lease_id = %lease.id, volume_id = %volume_id, error = %e, "mount check during release");
            }
        }

        if let Some(nonce) = details.and_then(|d| d.nonce.clone()) {
            if let Err(e) = store.release_volume_lease(&volume_id, &nonce).await {
                warn!(lease_id = %lease.id, volume_id = %volume_id, error = %e, "volume lease release");
            }
        }
    }

    async fn handle_delete(&self, entity: &Entity) -> Result<()> {
        if let Ok(lease) = DiskLease::decode(entity) {
            let (held, details) = {
                let state = self.state.lock();
                (
                    state.active.get(&lease.disk_id) == Some(&lease.id),
                    state.details.get(&lease.id).cloned(),
                )
            };
            if held {
                self.teardown(&lease, details.as_ref()).await;
            }
            let mut state = self.state.lock();
            if state.active.get(&lease.disk_id) == Some(&lease.id) {
                state.active.remove(&lease.disk_id);
            }
            state.details.remove(&lease.id);
        }

        match self.entities.delete(&entity.id).await {
            Ok(()) | Err(miren_entity::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------
    // State helpers

    fn drop_reservation(&self, disk_id: &EntityId, lease_id: &EntityId) {
        let mut state = self.state.lock();
        if state.active.get(disk_id) == Some(lease_id) {
            state.active.remove(disk_id);
        }
    }

    fn drop_details(&self, lease_id: &EntityId) {
        self.state.lock().details.remove(lease_id);
    }

    fn abandon(&self, disk_id: &EntityId, lease_id: &EntityId) {
        self.drop_reservation(disk_id, lease_id);
        self.drop_details(lease_id);
    }

    async fn fail_lease(&self, lease_id: &EntityId, message: &str) -> Result<()> {
        self.fail_with(lease_id, message.to_string()).await
    }

    async fn fail_with(&self, lease_id: &EntityId, message: String) -> Result<()> {
        warn!(lease_id = %lease_id, reason = %message, "lease failed");
        let mut attrs = Attrs::new();
        attrs.insert(
            ATTR_STATUS.to_string(),
            Value::from(LeaseStatus::Failed.as_str()),
        );
        attrs.insert(ATTR_ERROR_MESSAGE.to_string(), Value::from(message));
        match self.entities.patch(lease_id, attrs, None).await {
            // The record disappeared under us; nothing left to mark.
            Ok(_) | Err(miren_entity::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------
    // Background loops

    /// Drains the work queue: each enqueued lease id is refetched and
    /// reconciled against the database's current state.
    #[must_use]
    pub fn spawn_worker(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let rx = self.queue_rx.lock().take();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let Some(mut rx) = rx else {
                warn!("lease work queue already claimed by another worker");
                return;
            };
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    next = rx.recv() => {
                        let Some(id) = next else { return };
                        this.process_queued(id).await;
                    }
                }
            }
        })
    }

    async fn process_queued(&self, id: EntityId) {
        match self.entities.get(&id).await {
            Ok(entity) => {
                if let Err(e) = self.reconcile(&entity).await {
                    warn!(lease_id = %id, error = %e, "queued reconcile failed");
                }
            }
            Err(miren_entity::Error::NotFound { .. }) => {}
            Err(e) => warn!(lease_id = %id, error = %e, "fetching queued lease"),
        }
    }

    /// Re-enqueues every PENDING lease. Returns how many were enqueued.
    pub async fn resync_once(&self) -> Result<usize> {
        let mut enqueued = 0;
        for entity in self.entities.list(EntityKind::DiskLease).await? {
            if entity.get_str(ATTR_STATUS) == Some(LeaseStatus::Pending.as_str()) {
                if self.queue_tx.send(entity.id).is_ok() {
                    enqueued += 1;
                }
            }
        }
        if enqueued > 0 {
            debug!(count = enqueued, "re-enqueued pending leases");
        }
        Ok(enqueued)
    }

    /// Periodically re-enqueues pending leases so they make progress even
    /// when a watcher event was lost.
    #[must_use]
    pub fn spawn_resync(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RESYNC_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = this.resync_once().await {
                            warn!(error = %e, "pending-lease resync failed");
                        }
                    }
                }
            }
        })
    }

    /// Deletes RELEASED leases whose last update is older than `max_age`.
    /// Individual delete failures are logged; the sweep continues.
    pub async fn gc_once(&self, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut removed = 0;

        for entity in self.entities.list(EntityKind::DiskLease).await? {
            if entity.get_str(ATTR_STATUS) != Some(LeaseStatus::Released.as_str()) {
                continue;
            }
            if entity.updated_at > cutoff {
                continue;
            }
            match self.entities.delete(&entity.id).await {
                Ok(()) => {
                    info!(lease_id = %entity.id, "released lease garbage-collected");
                    removed += 1;
                }
                Err(e) => warn!(lease_id = %entity.id, error = %e, "lease GC delete"),
            }
        }
        Ok(removed)
    }

    /// Periodic sweep of aged RELEASED leases.
    #[must_use]
    pub fn spawn_gc(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GC_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = this.gc_once(GC_MAX_AGE).await {
                            warn!(error = %e, "released-lease GC failed");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Reconciler for LeaseReconciler {
    fn kind(&self) -> EntityKind {
        EntityKind::DiskLease
    }

    async fn create(&self, entity: Entity) -> Result<()> {
        self.reconcile(&entity).await
    }

    async fn update(&self, entity: Entity) -> Result<()> {
        self.reconcile(&entity).await
    }

    async fn delete(&self, entity: Entity) -> Result<()> {
        self.handle_delete(&entity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MountSpec;
    use miren_entity::MemoryEntityStore;
    use miren_volume::testing::MockVolumeStore;
    use miren_volume::Filesystem;

    struct Fixture {
        entities: Arc<MemoryEntityStore>,
        volumes: Arc<MockVolumeStore>,
        reconciler: Arc<LeaseReconciler>,
    }

    fn fixture() -> Fixture {
        fixture_with(MockVolumeStore::new())
    }

    fn fixture_with(volumes: MockVolumeStore) -> Fixture {
        let entities = Arc::new(MemoryEntityStore::new());
        let volumes = Arc::new(volumes);
        let reconciler = LeaseReconciler::new(
            Arc::clone(&entities) as Arc<dyn EntityStore>,
            VolumeStores::local_only(Arc::clone(&volumes) as Arc<dyn VolumeStore>),
            "node-a",
        );
        Fixture {
            entities,
            volumes,
            reconciler,
        }
    }

    fn disk_id() -> EntityId {
        EntityId::disk("d1").expect("valid id")
    }

    async fn seed_provisioned_disk(fix: &Fixture) {
        let disk = Disk::new(disk_id(), "scratch", 10)
            .with_volume_id("v-xyz")
            .with_status(DiskStatus::Provisioned);
        fix.entities.insert(disk.to_entity()).await.expect("insert disk");
        fix.volumes
            .ensure_in_segment_store("v-xyz", 10, Filesystem::Ext4)
            .await
            .expect("ensure volume");
    }

    async fn seed_lease(fix: &Fixture, name: &str, status: LeaseStatus) -> Entity {
        let lease = DiskLease::new(
            EntityId::lease(name).expect("valid id"),
            disk_id(),
            MountSpec::new("/data"),
        )
        .with_sandbox("sbx-1")
        .with_app("app-1")
        .with_node("node-a")
        .with_status(status);
        let entity = lease.to_entity();
        fix.entities.insert(entity.clone()).await.expect("insert lease");
        fix.entities.get(&entity.id).await.expect("get lease")
    }

    async fn lease_record(fix: &Fixture, name: &str) -> DiskLease {
        let entity = fix
            .entities
            .get(&EntityId::lease(name).expect("valid id"))
            .await
            .expect("get");
        DiskLease::decode(&entity).expect("decode")
    }

    // ===================
    // Binding
    // ===================

    #[tokio::test]
    async fn pending_lease_binds() {
        let fix = fixture();
        seed_provisioned_disk(&fix).await;
        let entity = seed_lease(&fix, "l1", LeaseStatus::Pending).await;

        fix.reconciler.create(entity).await.expect("bind");

        let lease = lease_record(&fix, "l1").await;
        assert_eq!(lease.status, LeaseStatus::Bound);
        assert!(lease.acquired_at.is_some());
        assert_eq!(lease.error_message, None);
        assert!(fix.volumes.is_mounted("v-xyz").await.expect("is_mounted"));
        assert_eq!(
            fix.reconciler.active_lease(&disk_id()),
            Some(EntityId::lease("l1").expect("valid id"))
        );
        // Exactly one of each side effect.
        assert_eq!(fix.volumes.call_count("acquire-lease", "v-xyz"), 1);
        assert_eq!(fix.volumes.call_count("initialize", "v-xyz"), 1);
        assert_eq!(fix.volumes.call_count("mount", "v-xyz"), 1);
    }

    #[tokio::test]
    async fn second_lease_conflicts() {
        let fix = fixture();
        seed_provisioned_disk(&fix).await;
        let first = seed_lease(&fix, "l1", LeaseStatus::Pending).await;
        fix.reconciler.create(first).await.expect("bind");

        let second = seed_lease(&fix, "l2", LeaseStatus::Pending).await;
        fix.reconciler.create(second).await.expect("reconcile");

        let lease = lease_record(&fix, "l2").await;
        assert_eq!(lease.status, LeaseStatus::Failed);
        let message = lease.error_message.expect("message");
        assert!(message.contains("already leased"));
        assert!(message.contains("lease/l1"));
        // The winner is undisturbed.
        assert_eq!(lease_record(&fix, "l1").await.status, LeaseStatus::Bound);
    }

    #[tokio::test]
    async fn provisioning_disk_leaves_lease_pending() {
        let fix = fixture();
        let disk = Disk::new(disk_id(), "scratch", 10).with_status(DiskStatus::Provisioning);
        fix.entities.insert(disk.to_entity()).await.expect("insert disk");
        let entity = seed_lease(&fix, "l1", LeaseStatus::Pending).await;

        fix.reconciler.create(entity).await.expect("reconcile");

        let lease = lease_record(&fix, "l1").await;
        assert_eq!(lease.status, LeaseStatus::Pending);
        // The reservation was released so the eventual bind can re-reserve.
        assert_eq!(fix.reconciler.active_lease(&disk_id()), None);
    }

    #[tokio::test]
    async fn disk_without_volume_id_fails_lease() {
        let fix = fixture();
        let disk = Disk::new(disk_id(), "scratch", 10).with_status(DiskStatus::Provisioned);
        fix.entities.insert(disk.to_entity()).await.expect("insert disk");
        let entity = seed_lease(&fix, "l1", LeaseStatus::Pending).await;

        fix.reconciler.create(entity).await.expect("reconcile");

        let lease = lease_record(&fix, "l1").await;
        assert_eq!(lease.status, LeaseStatus::Failed);
        assert!(lease.error_message.expect("message").contains("no volume id"));
        assert_eq!(fix.reconciler.active_lease(&disk_id()), None);
    }

    #[tokio::test]
    async fn mount_failure_fails_lease_and_releases_everything() {
        let fix = fixture();
        seed_provisioned_disk(&fix).await;
        fix.volumes.fail_mount("device exploded");
        let entity = seed_lease(&fix, "l1", LeaseStatus::Pending).await;

        fix.reconciler.create(entity).await.expect("reconcile");

        let lease = lease_record(&fix, "l1").await;
        assert_eq!(lease.status, LeaseStatus::Failed);
        assert!(lease.error_message.expect("message").contains("mounting volume"));
        assert_eq!(fix.reconciler.active_lease(&disk_id()), None);
        // The nonce taken for the bind was handed back.
        assert_eq!(fix.volumes.lease_nonce("v-xyz"), None);
    }

    #[tokio::test]
    async fn lease_acquisition_failure_fails_lease() {
        let fix = fixture();
        seed_provisioned_disk(&fix).await;
        fix.volumes.fail_acquire_lease();
        let entity = seed_lease(&fix, "l1", LeaseStatus::Pending).await;

        fix.reconciler.create(entity).await.expect("reconcile");

        let lease = lease_record(&fix, "l1").await;
        assert_eq!(lease.status, LeaseStatus::Failed);
        assert!(lease
            .error_message
            .expect("message")
            .contains("acquiring volume lease"));
    }

    #[tokio::test]
    async fn missing_disk_is_transient() {
        let fix = fixture();
        let entity = seed_lease(&fix, "l1", LeaseStatus::Pending).await;

        // No disk record at all: could be delivery ordering.
        assert!(fix.reconciler.create(entity).await.is_err());
        let lease = lease_record(&fix, "l1").await;
        assert_eq!(lease.status, LeaseStatus::Pending);
        assert_eq!(fix.reconciler.active_lease(&disk_id()), None);
    }

    // ===================
    // BOUND idempotence and adoption
    // ===================

    #[tokio::test]
    async fn bound_redelivery_is_a_noop() {
        let fix = fixture();
        seed_provisioned_disk(&fix).await;
        let entity = seed_lease(&fix, "l1", LeaseStatus::Pending).await;
        fix.reconciler.create(entity).await.expect("bind");

        let calls_before = fix.volumes.calls().len();
        for _ in 0..3 {
            let bound = fix
                .entities
                .get(&EntityId::lease("l1").expect("valid id"))
                .await
                .expect("get");
            fix.reconciler.update(bound).await.expect("redeliver");
        }
        // A healthy bound lease performs no further side effects.
        assert_eq!(fix.volumes.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn restart_adopts_bound_lease_from_database() {
        let fix = fixture();
        seed_provisioned_disk(&fix).await;
        // The database says BOUND; this controller's maps are empty.
        let entity = seed_lease(&fix, "l1", LeaseStatus::Bound).await;

        fix.reconciler.update(entity).await.expect("adopt");

        assert_eq!(
            fix.reconciler.active_lease(&disk_id()),
            Some(EntityId::lease("l1").expect("valid id"))
        );
        assert!(fix.volumes.is_mounted("v-xyz").await.expect("is_mounted"));
        assert_eq!(lease_record(&fix, "l1").await.status, LeaseStatus::Bound);
    }

    #[tokio::test]
    async fn bound_conflict_is_split_brain_failure() {
        let fix = fixture();
        seed_provisioned_disk(&fix).await;
        let first = seed_lease(&fix, "l1", LeaseStatus::Pending).await;
        fix.reconciler.create(first).await.expect("bind");

        // A second lease arrives already claiming BOUND for the same disk.
        let second = seed_lease(&fix, "l2", LeaseStatus::Bound).await;
        fix.reconciler.update(second).await.expect("reconcile");

        let lease = lease_record(&fix, "l2").await;
        assert_eq!(lease.status, LeaseStatus::Failed);
        assert!(lease.error_message.expect("message").contains("conflict"));
        // The holder keeps the disk.
        assert_eq!(
            fix.reconciler.active_lease(&disk_id()),
            Some(EntityId::lease("l1").expect("valid id"))
        );
    }

    // ===================
    // Release
    // ===================

    #[tokio::test]
    async fn released_lease_tears_down() {
        let fix = fixture();
        seed_provisioned_disk(&fix).await;
        let entity = seed_lease(&fix, "l1", LeaseStatus::Pending).await;
        fix.reconciler.create(entity).await.expect("bind");
        assert!(fix.volumes.is_mounted("v-xyz").await.expect("is_mounted"));

        let mut attrs = Attrs::new();
        attrs.insert(
            ATTR_STATUS.to_string(),
            Value::from(LeaseStatus::Released.as_str()),
        );
        fix.entities
            .patch(&EntityId::lease("l1").expect("valid id"), attrs, None)
            .await
            .expect("patch");
        let released = fix
            .entities
            .get(&EntityId::lease("l1").expect("valid id"))
            .await
            .expect("get");
        fix.reconciler.update(released.clone()).await.expect("release");

        assert!(!fix.volumes.is_mounted("v-xyz").await.expect("is_mounted"));
        assert_eq!(fix.reconciler.active_lease(&disk_id()), None);
        assert_eq!(fix.volumes.lease_nonce("v-xyz"), None);

        // Redelivery performs no further unmount attempts.
        let unmounts = fix.volumes.call_count("unmount", "v-xyz");
        fix.reconciler.update(released).await.expect("re-release");
        assert_eq!(fix.volumes.call_count("unmount", "v-xyz"), unmounts);
    }

    #[tokio::test]
    async fn rebind_after_release_succeeds() {
        let fix = fixture();
        seed_provisioned_disk(&fix).await;
        let entity = seed_lease(&fix, "l1", LeaseStatus::Pending).await;
        fix.reconciler.create(entity).await.expect("bind");

        let mut attrs = Attrs::new();
        attrs.insert(
            ATTR_STATUS.to_string(),
            Value::from(LeaseStatus::Released.as_str()),
        );
        fix.entities
            .patch(&EntityId::lease("l1").expect("valid id"), attrs, None)
            .await
            .expect("patch");
        let released = fix
            .entities
            .get(&EntityId::lease("l1").expect("valid id"))
            .await
            .expect("get");
        fix.reconciler.update(released).await.expect("release");

        let second = seed_lease(&fix, "l2", LeaseStatus::Pending).await;
        fix.reconciler.create(second).await.expect("bind l2");
        assert_eq!(lease_record(&fix, "l2").await.status, LeaseStatus::Bound);
    }

    // ===================
    // Delete
    // ===================

    #[tokio::test]
    async fn external_delete_tears_down_and_drops_record() {
        let fix = fixture();
        seed_provisioned_disk(&fix).await;
        let entity = seed_lease(&fix, "l1", LeaseStatus::Pending).await;
        fix.reconciler.create(entity).await.expect("bind");

        let bound = fix
            .entities
            .get(&EntityId::lease("l1").expect("valid id"))
            .await
            .expect("get");
        fix.reconciler.delete(bound).await.expect("delete");

        assert!(!fix.volumes.is_mounted("v-xyz").await.expect("is_mounted"));
        assert_eq!(fix.reconciler.active_lease(&disk_id()), None);
        assert!(fix
            .entities
            .get(&EntityId::lease("l1").expect("valid id"))
            .await
            .is_err());
    }

    // ===================
    // Directory Mode
    // ===================

    #[tokio::test]
    async fn directory_mode_bind_verifies_data_dir() {
        let fix = fixture_with(MockVolumeStore::directory());
        seed_provisioned_disk(&fix).await;
        fix.volumes.ensure_data_dir("v-xyz").await.expect("data dir");
        let entity = seed_lease(&fix, "l1", LeaseStatus::Pending).await;

        fix.reconciler.create(entity).await.expect("bind");

        let lease = lease_record(&fix, "l1").await;
        assert_eq!(lease.status, LeaseStatus::Bound);
        // No mount, no nonce in directory mode.
        assert_eq!(fix.volumes.call_count("mount", "v-xyz"), 0);
        assert_eq!(fix.volumes.call_count("acquire-lease", "v-xyz"), 0);
    }

    #[tokio::test]
    async fn directory_mode_missing_dir_fails_lease() {
        let fix = fixture_with(MockVolumeStore::directory());
        seed_provisioned_disk(&fix).await;
        let entity = seed_lease(&fix, "l1", LeaseStatus::Pending).await;

        fix.reconciler.create(entity).await.expect("reconcile");

        let lease = lease_record(&fix, "l1").await;
        assert_eq!(lease.status, LeaseStatus::Failed);
        assert!(lease.error_message.expect("message").contains("data directory"));
    }

    // ===================
    // GC and Resync
    // ===================

    #[tokio::test]
    async fn gc_removes_only_aged_released_leases() {
        let fix = fixture();
        seed_provisioned_disk(&fix).await;

        // An aged released lease, a fresh released lease, and a bound one.
        let aged = DiskLease::new(
            EntityId::lease("aged").expect("valid id"),
            disk_id(),
            MountSpec::new("/data"),
        )
        .with_status(LeaseStatus::Released)
        .to_entity()
        .with_updated_at(Utc::now() - chrono::Duration::hours(2));
        fix.entities.insert(aged).await.expect("insert");
        seed_lease(&fix, "fresh", LeaseStatus::Released).await;
        seed_lease(&fix, "bound", LeaseStatus::Bound).await;

        let removed = fix
            .reconciler
            .gc_once(Duration::from_secs(3600))
            .await
            .expect("gc");
        assert_eq!(removed, 1);

        assert!(fix
            .entities
            .get(&EntityId::lease("aged").expect("valid id"))
            .await
            .is_err());
        assert!(fix
            .entities
            .get(&EntityId::lease("fresh").expect("valid id"))
            .await
            .is_ok());
        assert!(fix
            .entities
            .get(&EntityId::lease("bound").expect("valid id"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn resync_enqueues_only_pending() {
        let fix = fixture();
        seed_provisioned_disk(&fix).await;
        seed_lease(&fix, "p1", LeaseStatus::Pending).await;
        seed_lease(&fix, "p2", LeaseStatus::Pending).await;
        seed_lease(&fix, "b1", LeaseStatus::Bound).await;

        let enqueued = fix.reconciler.resync_once().await.expect("resync");
        assert_eq!(enqueued, 2);
    }

    #[tokio::test]
    async fn worker_drains_queue_and_binds() {
        let fix = fixture();
        seed_provisioned_disk(&fix).await;
        seed_lease(&fix, "l1", LeaseStatus::Pending).await;

        let shutdown = CancellationToken::new();
        let worker = fix.reconciler.spawn_worker(shutdown.clone());

        fix.reconciler
            .work_queue()
            .send(EntityId::lease("l1").expect("valid id"))
            .expect("send");

        // Wait for the worker to process the item.
        for _ in 0..100 {
            if lease_record(&fix, "l1").await.status == LeaseStatus::Bound {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(lease_record(&fix, "l1").await.status, LeaseStatus::Bound);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker stops")
            .expect("worker should not panic");
    }
}
