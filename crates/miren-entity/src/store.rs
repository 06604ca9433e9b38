//! The entity store interface and an in-memory implementation.
//!
//! The store is the source of truth for `Disk` and `DiskLease` records. The
//! reconcile scheduler reads and writes it on behalf of the reconcilers;
//! reconcilers only ever patch the attributes they intend to change.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::entity::{Attrs, ChangeOp, Entity, EntityChange, EntityId, EntityKind};
use crate::error::{Error, Result};

/// Capacity of each per-kind change feed.
///
/// A lagged receiver gets a `Lagged` error and is expected to resubscribe
/// and fall back to a full list pass.
const CHANGE_FEED_CAPACITY: usize = 256;

/// Storage interface over the entity database.
///
/// Patches are optimistic: callers that pass an expected revision get a
/// [`Error::RevisionConflict`] when another writer got there first, which
/// reconcilers surface as a transient error for the scheduler to retry.
#[async_trait]
pub trait EntityStore: Send + Sync + 'static {
    /// Fetches an entity by id.
    async fn get(&self, id: &EntityId) -> Result<Entity>;

    /// Lists all entities of a kind.
    async fn list(&self, kind: EntityKind) -> Result<Vec<Entity>>;

    /// Lists entities of a kind whose attribute `key` equals `value`.
    ///
    /// This is the indexed lookup the disk watcher uses to find the leases
    /// referencing a disk.
    async fn list_where(&self, kind: EntityKind, key: &str, value: &Value) -> Result<Vec<Entity>>;

    /// Inserts a new entity, returning its initial revision.
    async fn insert(&self, entity: Entity) -> Result<u64>;

    /// Merges `attrs` into an existing entity and returns the new revision.
    ///
    /// A `Value::Null` removes the attribute. When `expected_revision` is
    /// `Some`, the patch only applies if the stored revision still matches.
    async fn patch(&self, id: &EntityId, attrs: Attrs, expected_revision: Option<u64>)
        -> Result<u64>;

    /// Removes an entity. Removing a missing entity is an error.
    async fn delete(&self, id: &EntityId) -> Result<()>;

    /// Subscribes to the change feed for a kind.
    fn watch(&self, kind: EntityKind) -> broadcast::Receiver<EntityChange>;
}

/// An in-memory entity store.
///
/// Backs the single-process runtime and the test suites. All state lives
/// behind one lock; the change feeds are broadcast channels so any number of
/// watchers can observe a kind.
pub struct MemoryEntityStore {
    entities: RwLock<HashMap<EntityId, Entity>>,
    disk_feed: broadcast::Sender<EntityChange>,
    lease_feed: broadcast::Sender<EntityChange>,
}

impl MemoryEntityStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (disk_feed, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let (lease_feed, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            entities: RwLock::new(HashMap::new()),
            disk_feed,
            lease_feed,
        }
    }

    /// Number of entities currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    fn feed(&self, kind: EntityKind) -> &broadcast::Sender<EntityChange> {
        match kind {
            EntityKind::Disk => &self.disk_feed,
            EntityKind::DiskLease => &self.lease_feed,
        }
    }

    fn publish(&self, id: &EntityId, op: ChangeOp) {
        if let Some(kind) = id.kind() {
            // Send only fails when no receiver is subscribed, which is fine.
            let _ = self.feed(kind).send(EntityChange { id: id.clone(), op });
        }
    }
}

impl Default for MemoryEntityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn get(&self, id: &EntityId) -> Result<Entity> {
        self.entities
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound { id: id.clone() })
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<Entity>> {
        Ok(self
            .entities
            .read()
            .values()
            .filter(|e| e.id.kind() == Some(kind))
            .cloned()
            .collect())
    }

    async fn list_where(&self, kind: EntityKind, key: &str, value: &Value) -> Result<Vec<Entity>> {
        Ok(self
            .entities
            .read()
            .values()
            .filter(|e| e.id.kind() == Some(kind) && e.attrs.get(key) == Some(value))
            .cloned()
            .collect())
    }

    async fn insert(&self, mut entity: Entity) -> Result<u64> {
        let id = entity.id.clone();
        {
            let mut entities = self.entities.write();
            if entities.contains_key(&id) {
                return Err(Error::AlreadyExists { id });
            }
            entity.revision = 1;
            entities.insert(id.clone(), entity);
        }

        debug!(entity_id = %id, "entity inserted");
        self.publish(&id, ChangeOp::Created);
        Ok(1)
    }

    async fn patch(
        &self,
        id: &EntityId,
        attrs: Attrs,
        expected_revision: Option<u64>,
    ) -> Result<u64> {
        let revision = {
            let mut entities = self.entities.write();
            let entity = entities
                .get_mut(id)
                .ok_or_else(|| Error::NotFound { id: id.clone() })?;

            if let Some(expected) = expected_revision {
                if entity.revision != expected {
                    return Err(Error::RevisionConflict {
                        id: id.clone(),
                        expected,
                        actual: entity.revision,
                    });
                }
            }

            for (key, value) in attrs {
                if value.is_null() {
                    entity.attrs.remove(&key);
                } else {
                    entity.attrs.insert(key, value);
                }
            }
            entity.revision += 1;
            entity.updated_at = chrono::Utc::now();
            entity.revision
        };

        debug!(entity_id = %id, revision, "entity patched");
        self.publish(id, ChangeOp::Updated);
        Ok(revision)
    }

    async fn delete(&self, id: &EntityId) -> Result<()> {
        let removed = self.entities.write().remove(id);
        if removed.is_none() {
            return Err(Error::NotFound { id: id.clone() });
        }

        debug!(entity_id = %id, "entity deleted");
        self.publish(id, ChangeOp::Deleted);
        Ok(())
    }

    fn watch(&self, kind: EntityKind) -> broadcast::Receiver<EntityChange> {
        self.feed(kind).subscribe()
    }
}
