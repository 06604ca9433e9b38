//! Typed records for `Disk` and `DiskLease` entities.
//!
//! The entity database stores attribute bags; these records are their typed
//! views. Encoding writes the full record; reconcilers patch back only the
//! attributes they change.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::Value;

use miren_entity::{decode_time, encode_time, Attrs, Entity, EntityId, EntityKind};
use miren_volume::Filesystem;

use crate::error::{Error, Result};

// Attribute names shared with the entity database schema.
pub(crate) const ATTR_STATUS: &str = "status";
pub(crate) const ATTR_VOLUME_ID: &str = "lsvd-volume-id";
pub(crate) const ATTR_DISK_ID: &str = "disk-id";
pub(crate) const ATTR_ERROR_MESSAGE: &str = "error-message";
pub(crate) const ATTR_ACQUIRED_AT: &str = "acquired-at";

/// Lifecycle status of a [`Disk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskStatus {
    /// Created; the backing volume does not exist yet.
    Provisioning,

    /// The backing volume exists and carries a volume id.
    Provisioned,

    /// A lease currently holds the disk (observational, lease-managed).
    Attached,

    /// No lease holds the disk (observational, lease-managed).
    Detached,

    /// The disk should be unprovisioned and its record removed.
    Deleting,

    /// Provisioning or deletion failed; terminal until an operator steps in.
    Error,
}

impl DiskStatus {
    /// The wire name stored in the entity database.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "PROVISIONING",
            Self::Provisioned => "PROVISIONED",
            Self::Attached => "ATTACHED",
            Self::Detached => "DETACHED",
            Self::Deleting => "DELETING",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for DiskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PROVISIONING" => Ok(Self::Provisioning),
            "PROVISIONED" => Ok(Self::Provisioned),
            "ATTACHED" => Ok(Self::Attached),
            "DETACHED" => Ok(Self::Detached),
            "DELETING" => Ok(Self::Deleting),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown disk status '{other}'")),
        }
    }
}

/// A declarative record for a persistent block device.
#[derive(Debug, Clone, PartialEq)]
pub struct Disk {
    /// The disk's entity id.
    pub id: EntityId,

    /// Human-readable name.
    pub name: String,

    /// Requested size in GiB. Must be positive to provision.
    pub size_gib: i64,

    /// Filesystem the disk carries.
    pub filesystem: Filesystem,

    /// Whether the backing volume lives only in the remote store.
    pub remote_only: bool,

    /// The backing volume id. Assigned at provisioning, or supplied up
    /// front to attach to a pre-existing volume; once set it never changes.
    pub volume_id: Option<String>,

    /// Lifecycle status.
    pub status: DiskStatus,

    /// Who created the disk.
    pub created_by: Option<String>,
}

impl Disk {
    /// Creates a disk record in `PROVISIONING`.
    #[must_use]
    pub fn new(id: EntityId, name: impl Into<String>, size_gib: i64) -> Self {
        Self {
            id,
            name: name.into(),
            size_gib,
            filesystem: Filesystem::default(),
            remote_only: false,
            volume_id: None,
            status: DiskStatus::Provisioning,
            created_by: None,
        }
    }

    /// Sets the filesystem.
    #[must_use]
    pub fn with_filesystem(mut self, filesystem: Filesystem) -> Self {
        self.filesystem = filesystem;
        self
    }

    /// Marks the disk remote-only.
    #[must_use]
    pub fn remote_only(mut self) -> Self {
        self.remote_only = true;
        self
    }

    /// Supplies a pre-existing backing volume id (attach mode).
    #[must_use]
    pub fn with_volume_id(mut self, volume_id: impl Into<String>) -> Self {
        self.volume_id = Some(volume_id.into());
        self
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(mut self, status: DiskStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the creator.
    #[must_use]
    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = Some(created_by.into());
        self
    }

    /// Encodes the full record into entity attributes.
    #[must_use]
    pub fn encode(&self) -> Attrs {
        let mut attrs = Attrs::new();
        attrs.insert("name".to_string(), Value::from(self.name.clone()));
        attrs.insert("size-gib".to_string(), Value::from(self.size_gib));
        attrs.insert(
            "filesystem".to_string(),
            Value::from(self.filesystem.name()),
        );
        attrs.insert("remote-only".to_string(), Value::from(self.remote_only));
        if let Some(volume_id) = &self.volume_id {
            attrs.insert(ATTR_VOLUME_ID.to_string(), Value::from(volume_id.clone()));
        }
        attrs.insert(ATTR_STATUS.to_string(), Value::from(self.status.as_str()));
        if let Some(created_by) = &self.created_by {
            attrs.insert("created-by".to_string(), Value::from(created_by.clone()));
        }
        attrs
    }

    /// Builds the entity for this record.
    #[must_use]
    pub fn to_entity(&self) -> Entity {
        let mut entity = Entity::new(self.id.clone());
        entity.attrs = self.encode();
        entity
    }

    /// Decodes a disk entity.
    ///
    /// # Errors
    ///
    /// Returns an error for a non-disk entity, a missing or unknown status,
    /// or an unknown filesystem.
    pub fn decode(entity: &Entity) -> Result<Self> {
        if entity.id.kind() != Some(EntityKind::Disk) {
            return Err(Error::WrongKind {
                id: entity.id.clone(),
                expected: "disk",
            });
        }

        let status = entity
            .get_str(ATTR_STATUS)
            .ok_or_else(|| Error::Decode {
                id: entity.id.clone(),
                reason: "missing status".to_string(),
            })?
            .parse::<DiskStatus>()
            .map_err(|reason| Error::Decode {
                id: entity.id.clone(),
                reason,
            })?;

        let filesystem = match entity.get_str("filesystem") {
            None => Filesystem::default(),
            Some(raw) => raw.parse::<Filesystem>().map_err(|_| Error::Decode {
                id: entity.id.clone(),
                reason: format!("unknown filesystem '{raw}'"),
            })?,
        };

        Ok(Self {
            id: entity.id.clone(),
            name: entity.get_str("name").unwrap_or_default().to_string(),
            size_gib: entity.get_i64("size-gib").unwrap_or(0),
            filesystem,
            remote_only: entity.get_bool("remote-only").unwrap_or(false),
            volume_id: entity
                .get_str(ATTR_VOLUME_ID)
                .filter(|v| !v.is_empty())
                .map(ToString::to_string),
            status,
            created_by: entity.get_str("created-by").map(ToString::to_string),
        })
    }
}

/// Lifecycle status of a [`DiskLease`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseStatus {
    /// Waiting to bind.
    Pending,

    /// Bound; the mount is live.
    Bound,

    /// Binding failed; terminal.
    Failed,

    /// Released by the user or system; awaiting teardown and GC.
    Released,
}

impl LeaseStatus {
    /// The wire name stored in the entity database.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Bound => "BOUND",
            Self::Failed => "FAILED",
            Self::Released => "RELEASED",
        }
    }
}

impl fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeaseStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "BOUND" => Ok(Self::Bound),
            "FAILED" => Ok(Self::Failed),
            "RELEASED" => Ok(Self::Released),
            other => Err(format!("unknown lease status '{other}'")),
        }
    }
}

/// How a leased disk should be mounted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MountSpec {
    /// Where the sandbox expects the disk.
    pub path: PathBuf,

    /// Raw mount options, passed through to the mount.
    pub options: Option<String>,

    /// Whether the mount is read-only.
    pub read_only: bool,
}

impl MountSpec {
    /// Creates a read-write mount spec.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            options: None,
            read_only: false,
        }
    }

    /// Sets mount options.
    #[must_use]
    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = Some(options.into());
        self
    }

    /// Makes the mount read-only.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// An exclusive claim by a sandbox on a disk.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskLease {
    /// The lease's entity id.
    pub id: EntityId,

    /// The disk being claimed.
    pub disk_id: EntityId,

    /// The sandbox the claim is for.
    pub sandbox_id: String,

    /// The application the claim is for.
    pub app_id: String,

    /// The node the sandbox runs on.
    pub node_id: String,

    /// Mount specification.
    pub mount: MountSpec,

    /// Lifecycle status.
    pub status: LeaseStatus,

    /// When the lease was bound, truncated to seconds.
    pub acquired_at: Option<DateTime<Utc>>,

    /// Why the lease failed, when it did.
    pub error_message: Option<String>,
}

impl DiskLease {
    /// Creates a pending lease.
    #[must_use]
    pub fn new(id: EntityId, disk_id: EntityId, mount: MountSpec) -> Self {
        Self {
            id,
            disk_id,
            sandbox_id: String::new(),
            app_id: String::new(),
            node_id: String::new(),
            mount,
            status: LeaseStatus::Pending,
            acquired_at: None,
            error_message: None,
        }
    }

    /// Sets the sandbox id.
    #[must_use]
    pub fn with_sandbox(mut self, sandbox_id: impl Into<String>) -> Self {
        self.sandbox_id = sandbox_id.into();
        self
    }

    /// Sets the app id.
    #[must_use]
    pub fn with_app(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    /// Sets the node id.
    #[must_use]
    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(mut self, status: LeaseStatus) -> Self {
        self.status = status;
        self
    }

    /// Encodes the full record into entity attributes.
    #[must_use]
    pub fn encode(&self) -> Attrs {
        let mut attrs = Attrs::new();
        attrs.insert(
            ATTR_DISK_ID.to_string(),
            Value::from(self.disk_id.as_str()),
        );
        attrs.insert("sandbox-id".to_string(), Value::from(self.sandbox_id.clone()));
        attrs.insert("app-id".to_string(), Value::from(self.app_id.clone()));
        attrs.insert("node-id".to_string(), Value::from(self.node_id.clone()));
        attrs.insert(
            "mount-path".to_string(),
            Value::from(self.mount.path.to_string_lossy().into_owned()),
        );
        if let Some(options) = &self.mount.options {
            attrs.insert("mount-options".to_string(), Value::from(options.clone()));
        }
        attrs.insert(
            "mount-read-only".to_string(),
            Value::from(self.mount.read_only),
        );
        attrs.insert(ATTR_STATUS.to_string(), Value::from(self.status.as_str()));
        if let Some(at) = self.acquired_at {
            attrs.insert(ATTR_ACQUIRED_AT.to_string(), encode_time(at));
        }
        if let Some(message) = &self.error_message {
            attrs.insert(ATTR_ERROR_MESSAGE.to_string(), Value::from(message.clone()));
        }
        attrs
    }

    /// Builds the entity for this record.
    #[must_use]
    pub fn to_entity(&self) -> Entity {
        let mut entity = Entity::new(self.id.clone());
        entity.attrs = self.encode();
        entity
    }

    /// Decodes a lease entity.
    ///
    /// # Errors
    ///
    /// Returns an error for a non-lease entity, a missing disk reference, or
    /// a missing or unknown status.
    pub fn decode(entity: &Entity) -> Result<Self> {
        if entity.id.kind() != Some(EntityKind::DiskLease) {
            return Err(Error::WrongKind {
                id: entity.id.clone(),
                expected: "disk lease",
            });
        }

        let disk_id = entity
            .get_str(ATTR_DISK_ID)
            .ok_or_else(|| Error::Decode {
                id: entity.id.clone(),
                reason: "missing disk-id".to_string(),
            })
            .and_then(|raw| {
                EntityId::parse(raw).map_err(|e| Error::Decode {
                    id: entity.id.clone(),
                    reason: format!("bad disk-id: {e}"),
                })
            })?;

        let status = entity
            .get_str(ATTR_STATUS)
            .ok_or_else(|| Error::Decode {
                id: entity.id.clone(),
                reason: "missing status".to_string(),
            })?
            .parse::<LeaseStatus>()
            .map_err(|reason| Error::Decode {
                id: entity.id.clone(),
                reason,
            })?;

        Ok(Self {
            id: entity.id.clone(),
            disk_id,
            sandbox_id: entity.get_str("sandbox-id").unwrap_or_default().to_string(),
            app_id: entity.get_str("app-id").unwrap_or_default().to_string(),
            node_id: entity.get_str("node-id").unwrap_or_default().to_string(),
            mount: MountSpec {
                path: PathBuf::from(entity.get_str("mount-path").unwrap_or_default()),
                options: entity.get_str("mount-options").map(ToString::to_string),
                read_only: entity.get_bool("mount-read-only").unwrap_or(false),
            },
            status,
            acquired_at: entity.get_str(ATTR_ACQUIRED_AT).and_then(decode_time),
            error_message: entity.get_str(ATTR_ERROR_MESSAGE).map(ToString::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::SubsecRound;
    use proptest::prelude::*;
    use test_case::test_case;

    fn disk_id(name: &str) -> EntityId {
        EntityId::disk(name).expect("valid id")
    }

    fn lease_id(name: &str) -> EntityId {
        EntityId::lease(name).expect("valid id")
    }

    // ===================
    // Status Wire Names
    // ===================

    #[test_case(DiskStatus::Provisioning, "PROVISIONING")]
    #[test_case(DiskStatus::Provisioned, "PROVISIONED")]
    #[test_case(DiskStatus::Attached, "ATTACHED")]
    #[test_case(DiskStatus::Detached, "DETACHED")]
    #[test_case(DiskStatus::Deleting, "DELETING")]
    #[test_case(DiskStatus::Error, "ERROR")]
    fn disk_status_roundtrip(status: DiskStatus, wire: &str) {
        assert_eq!(status.as_str(), wire);
        assert_eq!(wire.parse::<DiskStatus>().expect("parse"), status);
    }

    #[test_case(LeaseStatus::Pending, "PENDING")]
    #[test_case(LeaseStatus::Bound, "BOUND")]
    #[test_case(LeaseStatus::Failed, "FAILED")]
    #[test_case(LeaseStatus::Released, "RELEASED")]
    fn lease_status_roundtrip(status: LeaseStatus, wire: &str) {
        assert_eq!(status.as_str(), wire);
        assert_eq!(wire.parse::<LeaseStatus>().expect("parse"), status);
    }

    #[test]
    fn unknown_statuses_rejected() {
        assert!("BOUND".parse::<DiskStatus>().is_err());
        assert!("PROVISIONED".parse::<LeaseStatus>().is_err());
    }

    // ===================
    // Disk Codec
    // ===================

    #[test]
    fn disk_roundtrip_full() {
        let disk = Disk::new(disk_id("d1"), "scratch", 10)
            .with_filesystem(Filesystem::Xfs)
            .remote_only()
            .with_volume_id("v-xyz")
            .with_status(DiskStatus::Provisioned)
            .with_created_by("user-1");

        let decoded = Disk::decode(&disk.to_entity()).expect("decode");
        assert_eq!(decoded, disk);
    }

    #[test]
    fn disk_decode_minimal() {
        let entity = Entity::new(disk_id("d1")).with_attr(ATTR_STATUS, "PROVISIONING");
        let disk = Disk::decode(&entity).expect("decode");
        assert_eq!(disk.size_gib, 0);
        assert_eq!(disk.filesystem, Filesystem::Ext4);
        assert_eq!(disk.volume_id, None);
        assert!(!disk.remote_only);
    }

    #[test]
    fn disk_decode_empty_volume_id_is_none() {
        let entity = Entity::new(disk_id("d1"))
            .with_attr(ATTR_STATUS, "PROVISIONED")
            .with_attr(ATTR_VOLUME_ID, "");
        let disk = Disk::decode(&entity).expect("decode");
        assert_eq!(disk.volume_id, None);
    }

    #[test]
    fn disk_decode_missing_status_fails() {
        let entity = Entity::new(disk_id("d1"));
        assert!(matches!(Disk::decode(&entity), Err(Error::Decode { .. })));
    }

    #[test]
    fn disk_decode_wrong_kind_fails() {
        let entity = Entity::new(lease_id("l1")).with_attr(ATTR_STATUS, "PROVISIONING");
        assert!(matches!(Disk::decode(&entity), Err(Error::WrongKind { .. })));
    }

    // ===================
    // Lease Codec
    // ===================

    #[test]
    fn lease_roundtrip_full() {
        let mut lease = DiskLease::new(
            lease_id("l1"),
            disk_id("d1"),
            MountSpec::new("/data").with_options("noatime").read_only(),
        )
        .with_sandbox("sbx-1")
        .with_app("app-1")
        .with_node("node-a")
        .with_status(LeaseStatus::Bound);
        lease.acquired_at = Some(Utc::now().trunc_subsecs(0));
        lease.error_message = None;

        let decoded = DiskLease::decode(&lease.to_entity()).expect("decode");
        assert_eq!(decoded, lease);
    }

    #[test]
    fn lease_acquired_at_truncates_to_seconds() {
        let mut lease = DiskLease::new(lease_id("l1"), disk_id("d1"), MountSpec::new("/data"));
        lease.acquired_at = Some(Utc::now());

        let decoded = DiskLease::decode(&lease.to_entity()).expect("decode");
        assert_eq!(
            decoded.acquired_at,
            lease.acquired_at.map(|at| at.trunc_subsecs(0))
        );
    }

    #[test]
    fn lease_decode_missing_disk_fails() {
        let entity = Entity::new(lease_id("l1")).with_attr(ATTR_STATUS, "PENDING");
        assert!(matches!(DiskLease::decode(&entity), Err(Error::Decode { .. })));
    }

    #[test]
    fn lease_decode_wrong_kind_fails() {
        let entity = Entity::new(disk_id("d1"))
            .with_attr(ATTR_DISK_ID, "disk/d1")
            .with_attr(ATTR_STATUS, "PENDING");
        assert!(matches!(
            DiskLease::decode(&entity),
            Err(Error::WrongKind { .. })
        ));
    }

    // ===================
    // Property Round-Trips
    // ===================

    fn arb_disk_status() -> impl Strategy<Value = DiskStatus> {
        prop_oneof![
            Just(DiskStatus::Provisioning),
            Just(DiskStatus::Provisioned),
            Just(DiskStatus::Attached),
            Just(DiskStatus::Detached),
            Just(DiskStatus::Deleting),
            Just(DiskStatus::Error),
        ]
    }

    fn arb_filesystem() -> impl Strategy<Value = Filesystem> {
        prop_oneof![
            Just(Filesystem::Ext4),
            Just(Filesystem::Xfs),
            Just(Filesystem::Btrfs),
        ]
    }

    proptest! {
        #[test]
        fn disk_codec_roundtrips(
            name in "[a-z][a-z0-9-]{0,20}",
            size_gib in 1i64..100_000,
            fs in arb_filesystem(),
            remote in any::<bool>(),
            volume in proptest::option::of("[a-z0-9-]{1,30}"),
            status in arb_disk_status(),
        ) {
            let mut disk = Disk::new(disk_id("d1"), name, size_gib)
                .with_filesystem(fs)
                .with_status(status);
            disk.remote_only = remote;
            disk.volume_id = volume;

            let decoded = Disk::decode(&disk.to_entity()).expect("decode");
            prop_assert_eq!(decoded, disk);
        }
    }
}
