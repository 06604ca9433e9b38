//! The reconciler contract and volume-store selection.

use std::sync::Arc;

use async_trait::async_trait;

use miren_entity::{Entity, EntityKind};
use miren_volume::VolumeStore;

use crate::error::{Error, Result};
use crate::types::Disk;

/// The contract the reconcile scheduler drives.
///
/// The scheduler watches the entity database and delivers each change as a
/// `(kind, id, current-entity)` callback, serially per kind. Reconcilers
/// must be idempotent under redelivery; a returned error asks the scheduler
/// to retry with backoff.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// The entity kind this reconciler converges.
    fn kind(&self) -> EntityKind;

    /// A new entity appeared.
    async fn create(&self, entity: Entity) -> Result<()>;

    /// An existing entity changed (or was redelivered).
    async fn update(&self, entity: Entity) -> Result<()>;

    /// The entity was deleted externally.
    async fn delete(&self, entity: Entity) -> Result<()>;
}

/// The volume-store handles a controller runs with.
///
/// Most disks live in the local (or local-with-replica) store; disks marked
/// `remote-only` use the remote store, which is optional per deployment.
#[derive(Clone)]
pub struct VolumeStores {
    local: Arc<dyn VolumeStore>,
    remote: Option<Arc<dyn VolumeStore>>,
}

impl VolumeStores {
    /// A controller with only a local store.
    #[must_use]
    pub fn local_only(local: Arc<dyn VolumeStore>) -> Self {
        Self {
            local,
            remote: None,
        }
    }

    /// A controller with both local and remote stores.
    #[must_use]
    pub fn with_remote(local: Arc<dyn VolumeStore>, remote: Arc<dyn VolumeStore>) -> Self {
        Self {
            local,
            remote: Some(remote),
        }
    }

    /// The local store.
    #[must_use]
    pub fn local(&self) -> &Arc<dyn VolumeStore> {
        &self.local
    }

    /// Selects a store by placement flag.
    pub fn select(&self, remote_only: bool) -> Result<Arc<dyn VolumeStore>> {
        if remote_only {
            self.remote.clone().ok_or_else(|| Error::Config {
                reason: "no remote volume store is configured".to_string(),
            })
        } else {
            Ok(Arc::clone(&self.local))
        }
    }

    /// Selects the store appropriate for a disk's placement.
    pub fn for_disk(&self, disk: &Disk) -> Result<Arc<dyn VolumeStore>> {
        if disk.remote_only {
            self.remote.clone().ok_or_else(|| Error::Config {
                reason: format!(
                    "disk {} is remote-only but no remote volume store is configured",
                    disk.id
                ),
            })
        } else {
            Ok(Arc::clone(&self.local))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DiskStatus;
    use miren_entity::EntityId;
    use miren_volume::testing::MockVolumeStore;

    fn disk(remote_only: bool) -> Disk {
        let mut disk = Disk::new(EntityId::disk("d1").expect("valid id"), "scratch", 1)
            .with_status(DiskStatus::Provisioning);
        disk.remote_only = remote_only;
        disk
    }

    #[test]
    fn local_disk_selects_local_store() {
        let stores = VolumeStores::local_only(Arc::new(MockVolumeStore::new()));
        assert!(stores.for_disk(&disk(false)).is_ok());
    }

    #[test]
    fn remote_disk_without_remote_store_is_config_error() {
        let stores = VolumeStores::local_only(Arc::new(MockVolumeStore::new()));
        assert!(matches!(
            stores.for_disk(&disk(true)),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn remote_disk_selects_remote_store() {
        let stores = VolumeStores::with_remote(
            Arc::new(MockVolumeStore::new()),
            Arc::new(MockVolumeStore::new()),
        );
        assert!(stores.for_disk(&disk(true)).is_ok());
    }
}
