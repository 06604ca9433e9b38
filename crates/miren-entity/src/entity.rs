//! Core types for the entity database.
//!
//! Entities are bags of named attributes keyed by a validated identifier.
//! Reconcilers decode them into typed records, act, and write back only the
//! attributes they intend to change.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Maximum length of an entity identifier.
pub const ENTITY_ID_MAX_LENGTH: usize = 253;

/// Kinds of entities managed by the disk subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// A declarative record for a persistent block device.
    Disk,

    /// An exclusive claim by a sandbox on a disk.
    DiskLease,
}

impl EntityKind {
    /// The identifier prefix for entities of this kind.
    #[must_use]
    pub const fn prefix(&self) -> &'static str {
        match self {
            Self::Disk => "disk",
            Self::DiskLease => "lease",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A validated identifier for an entity.
///
/// Entity IDs have the shape `<kind-prefix>/<name>`, e.g. `disk/d1` or
/// `lease/l1`. Names must:
/// - Be non-empty and keep the full id within 253 characters
/// - Contain only lowercase alphanumeric characters, hyphens, underscores,
///   and dots
/// - Start with an alphanumeric character
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    /// Creates an `EntityId` from a full `<prefix>/<name>` string.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is malformed.
    pub fn parse(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Creates the identifier for a disk with the given name.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid.
    pub fn disk(name: &str) -> Result<Self> {
        Self::parse(format!("{}/{name}", EntityKind::Disk.prefix()))
    }

    /// Creates the identifier for a lease with the given name.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid.
    pub fn lease(name: &str) -> Result<Self> {
        Self::parse(format!("{}/{name}", EntityKind::DiskLease.prefix()))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the kind encoded in the identifier prefix, if recognized.
    #[must_use]
    pub fn kind(&self) -> Option<EntityKind> {
        match self.0.split_once('/') {
            Some(("disk", _)) => Some(EntityKind::Disk),
            Some(("lease", _)) => Some(EntityKind::DiskLease),
            _ => None,
        }
    }

    /// Returns the name portion of the identifier (after the prefix).
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.split_once('/').map_or(self.0.as_str(), |(_, n)| n)
    }

    fn validate(id: &str) -> Result<()> {
        if id.len() > ENTITY_ID_MAX_LENGTH {
            return Err(Error::InvalidEntityId {
                reason: format!("identifier exceeds maximum length of {ENTITY_ID_MAX_LENGTH} characters"),
            });
        }

        let Some((prefix, name)) = id.split_once('/') else {
            return Err(Error::InvalidEntityId {
                reason: "identifier must have the shape <kind>/<name>".to_string(),
            });
        };

        if prefix.is_empty() || name.is_empty() {
            return Err(Error::InvalidEntityId {
                reason: "identifier prefix and name cannot be empty".to_string(),
            });
        }

        let first = name.chars().next().unwrap_or('-');
        if !first.is_ascii_alphanumeric() {
            return Err(Error::InvalidEntityId {
                reason: "name must start with an alphanumeric character".to_string(),
            });
        }

        for c in name.chars() {
            if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' && c != '_' && c != '.' {
                return Err(Error::InvalidEntityId {
                    reason: format!(
                        "name contains invalid character '{c}'; only lowercase alphanumeric, hyphens, underscores, and dots are allowed"
                    ),
                });
            }
        }

        Ok(())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EntityId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The attribute bag carried by an entity.
pub type Attrs = BTreeMap<String, Value>;

/// A single record in the entity database.
///
/// The database is the sole authority for entity state; everything the
/// controller holds in memory is a cache derived from entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// The entity identifier.
    pub id: EntityId,

    /// Monotonic revision, bumped on every write.
    pub revision: u64,

    /// When the entity was last written. Inserts store the record as given;
    /// patches stamp the current time.
    pub updated_at: DateTime<Utc>,

    /// Named attributes.
    pub attrs: Attrs,
}

impl Entity {
    /// Creates a new entity with no attributes at revision zero.
    #[must_use]
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            revision: 0,
            updated_at: Utc::now(),
            attrs: Attrs::new(),
        }
    }

    /// Sets the last-update timestamp, consuming and returning the entity.
    ///
    /// Mostly useful to seed aged records in tests; the store stamps this on
    /// every patch.
    #[must_use]
    pub fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = at;
        self
    }

    /// Sets an attribute, consuming and returning the entity.
    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// Sets an attribute in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.attrs.insert(key.into(), value.into());
    }

    /// Returns a string attribute, if present and a string.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(Value::as_str)
    }

    /// Returns an unsigned integer attribute, if present and numeric.
    #[must_use]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.attrs.get(key).and_then(Value::as_u64)
    }

    /// Returns a signed integer attribute, if present and numeric.
    #[must_use]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.attrs.get(key).and_then(Value::as_i64)
    }

    /// Returns a boolean attribute, if present and boolean.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.attrs.get(key).and_then(Value::as_bool)
    }

    /// Returns a timestamp attribute decoded from RFC 3339, if present.
    #[must_use]
    pub fn get_time(&self, key: &str) -> Option<DateTime<Utc>> {
        self.get_str(key).and_then(decode_time)
    }

    /// Sets a timestamp attribute, truncated to whole seconds.
    pub fn set_time(&mut self, key: impl Into<String>, at: DateTime<Utc>) {
        self.attrs.insert(key.into(), encode_time(at));
    }
}

/// Encodes a timestamp as an RFC 3339 attribute value, truncated to seconds.
///
/// The database stores attributes as text; sub-second precision does not
/// survive the round trip and is dropped up front so comparisons stay exact.
#[must_use]
pub fn encode_time(at: DateTime<Utc>) -> Value {
    Value::String(at.trunc_subsecs(0).to_rfc3339())
}

/// Decodes an RFC 3339 attribute value back into a UTC timestamp.
#[must_use]
pub fn decode_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// The operation recorded by a change-feed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOp {
    /// The entity was inserted.
    Created,

    /// One or more attributes were patched.
    Updated,

    /// The entity was removed.
    Deleted,
}

/// A single event on an entity change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityChange {
    /// The entity that changed.
    pub id: EntityId,

    /// What happened to it.
    pub op: ChangeOp,
}
