//! End-to-end controller scenarios: disk provisioning, lease binding,
//! conflict, release, restart recovery, directory mode, and watcher-driven
//! wake-ups.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use miren_entity::{EntityId, EntityStore, MemoryEntityStore};
use miren_reconcile::{
    Disk, DiskLease, DiskReconciler, DiskStatus, DiskWatcher, LeaseReconciler, LeaseStatus,
    MountSpec, Reconciler, VolumeStores,
};
use miren_volume::testing::MockVolumeStore;
use miren_volume::{Filesystem, LsvdVolumeStore, VolumeStore, VolumeStoreConfig};

struct Controller {
    entities: Arc<MemoryEntityStore>,
    volumes: Arc<dyn VolumeStore>,
    disks: DiskReconciler,
    leases: Arc<LeaseReconciler>,
}

impl Controller {
    fn over(volumes: Arc<dyn VolumeStore>) -> Self {
        Self::with_entities(Arc::new(MemoryEntityStore::new()), volumes)
    }

    fn with_entities(entities: Arc<MemoryEntityStore>, volumes: Arc<dyn VolumeStore>) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let stores = VolumeStores::local_only(Arc::clone(&volumes));
        let disks = DiskReconciler::new(
            Arc::clone(&entities) as Arc<dyn EntityStore>,
            stores.clone(),
        );
        let leases = LeaseReconciler::new(
            Arc::clone(&entities) as Arc<dyn EntityStore>,
            stores,
            "node-a",
        );
        Self {
            entities,
            volumes,
            disks,
            leases,
        }
    }

    async fn create_disk(&self, name: &str, size_gib: i64) -> Disk {
        let disk = Disk::new(EntityId::disk(name).expect("valid id"), name, size_gib)
            .with_filesystem(Filesystem::Ext4);
        self.entities
            .insert(disk.to_entity())
            .await
            .expect("insert disk");
        let entity = self.entities.get(&disk.id).await.expect("get disk");
        self.disks.create(entity).await.expect("reconcile disk");
        self.disk(name).await
    }

    async fn disk(&self, name: &str) -> Disk {
        let entity = self
            .entities
            .get(&EntityId::disk(name).expect("valid id"))
            .await
            .expect("get disk");
        Disk::decode(&entity).expect("decode disk")
    }

    async fn create_lease(&self, name: &str, disk: &str) -> DiskLease {
        let lease = DiskLease::new(
            EntityId::lease(name).expect("valid id"),
            EntityId::disk(disk).expect("valid id"),
            MountSpec::new("/data"),
        )
        .with_sandbox(format!("sbx-{name}"))
        .with_app("app-1")
        .with_node("node-a");
        self.entities
            .insert(lease.to_entity())
            .await
            .expect("insert lease");
        let entity = self.entities.get(&lease.id).await.expect("get lease");
        self.leases.create(entity).await.expect("reconcile lease");
        self.lease(name).await
    }

    async fn lease(&self, name: &str) -> DiskLease {
        let entity = self
            .entities
            .get(&EntityId::lease(name).expect("valid id"))
            .await
            .expect("get lease");
        DiskLease::decode(&entity).expect("decode lease")
    }

    async fn set_lease_status(&self, name: &str, status: LeaseStatus) {
        let id = EntityId::lease(name).expect("valid id");
        let mut attrs = miren_entity::Attrs::new();
        attrs.insert(
            "status".to_string(),
            serde_json::Value::from(status.as_str()),
        );
        self.entities.patch(&id, attrs, None).await.expect("patch");
        let entity = self.entities.get(&id).await.expect("get");
        self.leases.update(entity).await.expect("reconcile");
    }
}

/// Happy path: a disk is provisioned, a lease binds, the volume is mounted.
#[tokio::test]
async fn provision_and_bind() {
    let mock = Arc::new(MockVolumeStore::new());
    let controller = Controller::over(Arc::clone(&mock) as Arc<dyn VolumeStore>);

    let disk = controller.create_disk("d1", 10).await;
    assert_eq!(disk.status, DiskStatus::Provisioned);
    let volume_id = disk.volume_id.expect("volume assigned");

    let lease = controller.create_lease("l1", "d1").await;
    assert_eq!(lease.status, LeaseStatus::Bound);
    assert!(lease.acquired_at.is_some());
    assert!(controller
        .volumes
        .is_mounted(&volume_id)
        .await
        .expect("is_mounted"));
}

/// A second lease on a bound disk fails, naming the holder.
#[tokio::test]
async fn second_lease_is_rejected() {
    let mock = Arc::new(MockVolumeStore::new());
    let controller = Controller::over(Arc::clone(&mock) as Arc<dyn VolumeStore>);

    controller.create_disk("d1", 10).await;
    controller.create_lease("l1", "d1").await;

    let second = controller.create_lease("l2", "d1").await;
    assert_eq!(second.status, LeaseStatus::Failed);
    let message = second.error_message.expect("error message");
    assert!(message.contains("already leased"));
    assert!(message.contains("lease/l1"));
}

/// Releasing the holder unmounts the volume and frees the disk for the next
/// lease.
#[tokio::test]
async fn release_then_rebind() {
    let mock = Arc::new(MockVolumeStore::new());
    let controller = Controller::over(Arc::clone(&mock) as Arc<dyn VolumeStore>);

    let disk = controller.create_disk("d1", 10).await;
    let volume_id = disk.volume_id.expect("volume assigned");
    controller.create_lease("l1", "d1").await;

    controller.set_lease_status("l1", LeaseStatus::Released).await;
    assert!(!controller
        .volumes
        .is_mounted(&volume_id)
        .await
        .expect("is_mounted"));
    assert_eq!(
        controller
            .leases
            .active_lease(&EntityId::disk("d1").expect("valid id")),
        None
    );

    let second = controller.create_lease("l2", "d1").await;
    assert_eq!(second.status, LeaseStatus::Bound);
    assert!(controller
        .volumes
        .is_mounted(&volume_id)
        .await
        .expect("is_mounted"));
}

/// A fresh controller adopts a BOUND lease straight from the database.
#[tokio::test]
async fn restart_recovers_bound_lease() {
    let entities = Arc::new(MemoryEntityStore::new());
    let mock = Arc::new(MockVolumeStore::new());

    // Preload the database: provisioned disk, bound lease. No controller has
    // seen either.
    let disk = Disk::new(EntityId::disk("d1").expect("valid id"), "d1", 10)
        .with_volume_id("v-xyz")
        .with_status(DiskStatus::Provisioned);
    entities.insert(disk.to_entity()).await.expect("insert disk");
    mock.ensure_in_segment_store("v-xyz", 10, Filesystem::Ext4)
        .await
        .expect("ensure volume");
    let lease = DiskLease::new(
        EntityId::lease("l1").expect("valid id"),
        EntityId::disk("d1").expect("valid id"),
        MountSpec::new("/data"),
    )
    .with_sandbox("sbx-1")
    .with_app("app-1")
    .with_node("node-a")
    .with_status(LeaseStatus::Bound);
    entities.insert(lease.to_entity()).await.expect("insert lease");

    // A controller with empty in-memory maps comes up and reconciles.
    let controller =
        Controller::with_entities(Arc::clone(&entities), Arc::clone(&mock) as Arc<dyn VolumeStore>);
    let entity = entities
        .get(&EntityId::lease("l1").expect("valid id"))
        .await
        .expect("get");
    controller.leases.update(entity).await.expect("adopt");

    assert_eq!(
        controller
            .leases
            .active_lease(&EntityId::disk("d1").expect("valid id")),
        Some(EntityId::lease("l1").expect("valid id"))
    );
    assert!(controller.volumes.is_mounted("v-xyz").await.expect("is_mounted"));
    assert_eq!(controller.lease("l1").await.status, LeaseStatus::Bound);
}

/// With no NBD backend the whole flow degrades to a data directory: no
/// mounts, no nonces, lease still BOUND.
#[tokio::test]
async fn directory_mode_end_to_end() {
    let root = tempfile::tempdir().expect("tempdir");
    let segments = Arc::new(miren_segment::LocalSegmentStore::new(
        root.path().join("lsvd-volumes"),
    ));
    let volumes = Arc::new(LsvdVolumeStore::new(
        VolumeStoreConfig::rooted_at(root.path()),
        segments,
        None,
    ));
    assert!(volumes.directory_mode());

    let controller = Controller::over(Arc::clone(&volumes) as Arc<dyn VolumeStore>);
    let disk = controller.create_disk("d1", 1).await;
    assert_eq!(disk.status, DiskStatus::Provisioned);
    let volume_id = disk.volume_id.expect("volume assigned");

    // Provisioning created the data directory on the real filesystem.
    let data_dir = root.path().join("disks").join("disk-data").join(&volume_id);
    assert!(data_dir.is_dir());

    let lease = controller.create_lease("l1", "d1").await;
    assert_eq!(lease.status, LeaseStatus::Bound);

    // Nothing is mounted; the directory stands in for the device.
    assert!(!controller
        .volumes
        .is_mounted(&volume_id)
        .await
        .expect("is_mounted"));
}

/// A lease created while its disk is still provisioning parks in PENDING,
/// then binds when the watcher sees the disk flip to PROVISIONED.
#[tokio::test]
async fn lease_binds_when_disk_becomes_ready() {
    let mock = Arc::new(MockVolumeStore::new());
    let controller = Controller::over(Arc::clone(&mock) as Arc<dyn VolumeStore>);

    // Disk exists but is not yet provisioned.
    let disk = Disk::new(EntityId::disk("d1").expect("valid id"), "d1", 10);
    controller
        .entities
        .insert(disk.to_entity())
        .await
        .expect("insert disk");

    // Wire up the watcher and the lease worker.
    let shutdown = CancellationToken::new();
    let worker = controller.leases.spawn_worker(shutdown.clone());
    let watcher = DiskWatcher::new(
        Arc::clone(&controller.entities) as Arc<dyn EntityStore>,
        controller.leases.work_queue(),
    )
    .spawn(shutdown.clone());

    // The lease stays pending: the disk is not ready.
    let lease = controller.create_lease("l1", "d1").await;
    assert_eq!(lease.status, LeaseStatus::Pending);

    // The disk reconciler provisions the disk; its patch lands on the change
    // feed, the watcher fans out, the worker binds the lease.
    let entity = controller
        .entities
        .get(&EntityId::disk("d1").expect("valid id"))
        .await
        .expect("get");
    controller.disks.update(entity).await.expect("provision");

    let mut bound = controller.lease("l1").await;
    for _ in 0..200 {
        if bound.status == LeaseStatus::Bound {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        bound = controller.lease("l1").await;
    }
    assert_eq!(bound.status, LeaseStatus::Bound);

    let volume_id = controller.disk("d1").await.volume_id.expect("volume");
    assert!(controller
        .volumes
        .is_mounted(&volume_id)
        .await
        .expect("is_mounted"));

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), worker)
        .await
        .expect("worker stops")
        .expect("worker ok");
    tokio::time::timeout(Duration::from_secs(1), watcher)
        .await
        .expect("watcher stops")
        .expect("watcher ok");
}
