//! # Miren Entity
//!
//! Entity database model and store interface for the Miren disk subsystem.
//!
//! The disk controller is driven entirely by declarative `Disk` and
//! `DiskLease` records held in an external entity database. This crate defines
//! the shape of those records as attribute bags, the [`EntityStore`]
//! interface the reconcilers consume, and an in-memory implementation used
//! by the single-process runtime and the test suites.
//!
//! ## Example
//!
//! ```rust
//! use miren_entity::{Entity, EntityId, EntityKind, EntityStore, MemoryEntityStore};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = MemoryEntityStore::new();
//!
//! let disk = Entity::new(EntityId::disk("d1").expect("valid id"))
//!     .with_attr("name", "scratch")
//!     .with_attr("size-gib", 10)
//!     .with_attr("status", "PROVISIONING");
//!
//! store.insert(disk).await.expect("insert");
//!
//! let disks = store.list(EntityKind::Disk).await.expect("list");
//! assert_eq!(disks.len(), 1);
//! # }
//! ```
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod entity;
pub mod error;
pub mod store;

// Re-export commonly used types
pub use entity::{
    decode_time, encode_time, Attrs, ChangeOp, Entity, EntityChange, EntityId, EntityKind,
    ENTITY_ID_MAX_LENGTH,
};
pub use error::{Error, Result};
pub use store::{EntityStore, MemoryEntityStore};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
