//! The disk reconciler: converges `Disk` records onto backing volumes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use miren_entity::{Attrs, Entity, EntityKind, EntityStore};

use crate::error::Result;
use crate::reconciler::{Reconciler, VolumeStores};
use crate::types::{Disk, DiskStatus, ATTR_STATUS, ATTR_VOLUME_ID};

/// Converges `Disk` records.
///
/// Reacts only to a disk's status. Provisioning allocates (or attaches to) a
/// backing volume and writes the volume id back; mounting is entirely the
/// lease side's job.
pub struct DiskReconciler {
    entities: Arc<dyn EntityStore>,
    stores: VolumeStores,
}

impl DiskReconciler {
    /// Creates a disk reconciler.
    #[must_use]
    pub fn new(entities: Arc<dyn EntityStore>, stores: VolumeStores) -> Self {
        Self { entities, stores }
    }

    async fn reconcile(&self, entity: &Entity) -> Result<()> {
        let disk = Disk::decode(entity)?;
        match disk.status {
            DiskStatus::Provisioning => self.provision(&disk).await,
            DiskStatus::Provisioned => self.verify(&disk).await,
            DiskStatus::Deleting => self.remove(&disk).await,
            // Observational statuses are owned by the lease side; ERROR is
            // terminal until an operator intervenes.
            DiskStatus::Attached | DiskStatus::Detached | DiskStatus::Error => Ok(()),
        }
    }

    /// Drives PROVISIONING → PROVISIONED.
    ///
    /// With a volume id already on the record this is attach mode: the
    /// volume is ensured under the requested id, which also absorbs the
    /// crash window where a volume was created but the record write-back
    /// never happened.
    async fn provision(&self, disk: &Disk) -> Result<()> {
        if disk.size_gib <= 0 {
            warn!(disk_id = %disk.id, size_gib = disk.size_gib, "disk has invalid size, marking ERROR");
            return self.set_status(disk, DiskStatus::Error).await;
        }

        let store = self.stores.for_disk(disk)?;
        let volume_id = disk
            .volume_id
            .clone()
            .unwrap_or_else(|| format!("v-{}", Uuid::new_v4()));

        store
            .ensure_in_segment_store(&volume_id, disk.size_gib as u64, disk.filesystem)
            .await?;

        if store.directory_mode() {
            store.ensure_data_dir(&volume_id).await?;
        }

        let mut attrs = Attrs::new();
        attrs.insert(ATTR_VOLUME_ID.to_string(), Value::from(volume_id.clone()));
        attrs.insert(
            ATTR_STATUS.to_string(),
            Value::from(DiskStatus::Provisioned.as_str()),
        );
        self.entities.patch(&disk.id, attrs, None).await?;

        info!(disk_id = %disk.id, volume_id = %volume_id, "disk provisioned");
        Ok(())
    }

    /// Re-verifies a PROVISIONED disk's backing volume.
    async fn verify(&self, disk: &Disk) -> Result<()> {
        let Some(volume_id) = disk.volume_id.clone() else {
            warn!(disk_id = %disk.id, "provisioned disk has no volume id, re-provisioning");
            return self.reprovision(disk).await;
        };

        let store = self.stores.for_disk(disk)?;
        match store.get_info(&volume_id).await {
            Ok(_) => {
                if store.directory_mode() {
                    store.ensure_data_dir(&volume_id).await?;
                }
                Ok(())
            }
            Err(miren_volume::Error::VolumeNotFound { .. }) => {
                warn!(disk_id = %disk.id, volume_id = %volume_id, "backing volume is missing, re-provisioning");
                self.reprovision(disk).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reprovision(&self, disk: &Disk) -> Result<()> {
        let mut cleared = disk.clone();
        cleared.volume_id = None;
        self.provision(&cleared).await
    }

    /// Drives DELETING: unprovision, then drop the record.
    async fn remove(&self, disk: &Disk) -> Result<()> {
        if let Some(volume_id) = &disk.volume_id {
            let store = self.stores.for_disk(disk)?;
            if let Err(e) = store.unprovision(volume_id).await {
                warn!(disk_id = %disk.id, volume_id = %volume_id, error = %e, "unprovision failed, marking ERROR");
                return self.set_status(disk, DiskStatus::Error).await;
            }
        }

        match self.entities.delete(&disk.id).await {
            Ok(()) | Err(miren_entity::Error::NotFound { .. }) => {
                info!(disk_id = %disk.id, "disk deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set_status(&self, disk: &Disk, status: DiskStatus) -> Result<()> {
        let mut attrs = Attrs::new();
        attrs.insert(ATTR_STATUS.to_string(), Value::from(status.as_str()));
        self.entities.patch(&disk.id, attrs, None).await?;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for DiskReconciler {
    fn kind(&self) -> EntityKind {
        EntityKind::Disk
    }

    async fn create(&self, entity: Entity) -> Result<()> {
        self.reconcile(&entity).await
    }

    async fn update(&self, entity: Entity) -> Result<()> {
        self.reconcile(&entity).await
    }

    async fn delete(&self, entity: Entity) -> Result<()> {
        // The record is already gone; release any runtime state we hold.
        if let Ok(disk) = Disk::decode(&entity) {
            if let Some(volume_id) = &disk.volume_id {
                if let Ok(store) = self.stores.for_disk(&disk) {
                    if let Err(e) = store.unprovision(volume_id).await {
                        warn!(disk_id = %disk.id, error = %e, "unprovision after external delete");
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use miren_entity::{EntityId, MemoryEntityStore};
    use miren_volume::testing::MockVolumeStore;
    use miren_volume::{Filesystem, VolumeStatus, VolumeStore};

    struct Fixture {
        entities: Arc<MemoryEntityStore>,
        volumes: Arc<MockVolumeStore>,
        reconciler: DiskReconciler,
    }

    fn fixture() -> Fixture {
        fixture_with(MockVolumeStore::new())
    }

    fn fixture_with(volumes: MockVolumeStore) -> Fixture {
        let entities = Arc::new(MemoryEntityStore::new());
        let volumes = Arc::new(volumes);
        let reconciler = DiskReconciler::new(
            Arc::clone(&entities) as Arc<dyn EntityStore>,
            VolumeStores::local_only(Arc::clone(&volumes) as Arc<dyn miren_volume::VolumeStore>),
        );
        Fixture {
            entities,
            volumes,
            reconciler,
        }
    }

    async fn seed_disk(fix: &Fixture, disk: &Disk) -> Entity {
        let entity = disk.to_entity();
        fix.entities.insert(entity.clone()).await.expect("insert");
        fix.entities.get(&entity.id).await.expect("get")
    }

    fn new_disk(size_gib: i64) -> Disk {
        Disk::new(EntityId::disk("d1").expect("valid id"), "scratch", size_gib)
            .with_filesystem(Filesystem::Ext4)
    }

    #[tokio::test]
    async fn provisioning_assigns_volume_and_transitions() {
        let fix = fixture();
        let entity = seed_disk(&fix, &new_disk(10)).await;

        fix.reconciler.create(entity).await.expect("reconcile");

        let stored = fix.entities.get(&EntityId::disk("d1").expect("id")).await.expect("get");
        let disk = Disk::decode(&stored).expect("decode");
        assert_eq!(disk.status, DiskStatus::Provisioned);
        let volume_id = disk.volume_id.expect("volume id assigned");
        assert!(volume_id.starts_with("v-"));

        let info = fix.volumes.get_info(&volume_id).await.expect("volume exists");
        assert_eq!(info.status, VolumeStatus::OnDisk);
        assert_eq!(info.size_bytes, 10 * miren_volume::GIB);
    }

    #[tokio::test]
    async fn provisioning_attach_mode_keeps_supplied_id() {
        let fix = fixture();
        let entity = seed_disk(&fix, &new_disk(5).with_volume_id("v-preexisting")).await;

        fix.reconciler.create(entity).await.expect("reconcile");

        let stored = fix.entities.get(&EntityId::disk("d1").expect("id")).await.expect("get");
        let disk = Disk::decode(&stored).expect("decode");
        assert_eq!(disk.status, DiskStatus::Provisioned);
        assert_eq!(disk.volume_id.as_deref(), Some("v-preexisting"));
        assert!(fix.volumes.get_info("v-preexisting").await.is_ok());
    }

    #[tokio::test]
    async fn provisioning_invalid_size_marks_error() {
        let fix = fixture();
        let entity = seed_disk(&fix, &new_disk(0)).await;

        fix.reconciler.create(entity).await.expect("reconcile");

        let stored = fix.entities.get(&EntityId::disk("d1").expect("id")).await.expect("get");
        assert_eq!(
            Disk::decode(&stored).expect("decode").status,
            DiskStatus::Error
        );
    }

    #[tokio::test]
    async fn provisioning_is_idempotent_on_redelivery() {
        let fix = fixture();
        let entity = seed_disk(&fix, &new_disk(10)).await;

        fix.reconciler.create(entity.clone()).await.expect("first");
        let after_first = fix.entities.get(&entity.id).await.expect("get");
        let first_volume = Disk::decode(&after_first).expect("decode").volume_id;

        // Redeliver the now-provisioned record.
        fix.reconciler.update(after_first).await.expect("second");
        let after_second = fix.entities.get(&entity.id).await.expect("get");
        assert_eq!(Disk::decode(&after_second).expect("decode").volume_id, first_volume);
    }

    #[tokio::test]
    async fn provisioned_with_missing_volume_reprovisions() {
        let fix = fixture();
        // PROVISIONED but the volume was never created in this store.
        let disk = new_disk(10)
            .with_volume_id("v-vanished")
            .with_status(DiskStatus::Provisioned);
        let entity = seed_disk(&fix, &disk).await;

        fix.reconciler.update(entity).await.expect("reconcile");

        let stored = fix.entities.get(&EntityId::disk("d1").expect("id")).await.expect("get");
        let decoded = Disk::decode(&stored).expect("decode");
        assert_eq!(decoded.status, DiskStatus::Provisioned);
        let volume_id = decoded.volume_id.expect("new volume id");
        assert_ne!(volume_id, "v-vanished");
        assert!(fix.volumes.get_info(&volume_id).await.is_ok());
    }

    #[tokio::test]
    async fn provisioned_with_empty_id_reprovisions() {
        let fix = fixture();
        let disk = new_disk(10).with_status(DiskStatus::Provisioned);
        let entity = seed_disk(&fix, &disk).await;

        fix.reconciler.update(entity).await.expect("reconcile");

        let stored = fix.entities.get(&EntityId::disk("d1").expect("id")).await.expect("get");
        assert!(Disk::decode(&stored).expect("decode").volume_id.is_some());
    }

    #[tokio::test]
    async fn deleting_unprovisions_and_drops_record() {
        let fix = fixture();
        let disk = new_disk(10)
            .with_volume_id("v-1")
            .with_status(DiskStatus::Deleting);
        fix.volumes
            .ensure_in_segment_store("v-1", 10, Filesystem::Ext4)
            .await
            .expect("ensure");
        let entity = seed_disk(&fix, &disk).await;

        fix.reconciler.update(entity).await.expect("reconcile");

        assert!(fix
            .entities
            .get(&EntityId::disk("d1").expect("id"))
            .await
            .is_err());
        assert_eq!(fix.volumes.call_count("unprovision", "v-1"), 1);
    }

    #[tokio::test]
    async fn observational_statuses_are_noops() {
        let fix = fixture();
        for status in [DiskStatus::Attached, DiskStatus::Detached, DiskStatus::Error] {
            let disk = new_disk(10).with_volume_id("v-1").with_status(status);
            let entity = disk.to_entity();
            fix.reconciler.update(entity).await.expect("no-op");
        }
        assert!(fix.volumes.calls().is_empty());
    }

    #[tokio::test]
    async fn directory_mode_provisioning_creates_data_dir() {
        let fix = fixture_with(MockVolumeStore::directory());
        let entity = seed_disk(&fix, &new_disk(10)).await;

        fix.reconciler.create(entity).await.expect("reconcile");

        let stored = fix.entities.get(&EntityId::disk("d1").expect("id")).await.expect("get");
        let volume_id = Disk::decode(&stored).expect("decode").volume_id.expect("id");
        assert!(fix.volumes.data_dir_exists(&volume_id).await.expect("exists"));
    }

    #[tokio::test]
    async fn remote_only_without_remote_store_errors() {
        let fix = fixture();
        let mut disk = new_disk(10);
        disk.remote_only = true;
        let entity = seed_disk(&fix, &disk).await;

        assert!(fix.reconciler.create(entity).await.is_err());
    }
}
