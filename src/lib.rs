//! `deltastore` is an in-memory, snapshot-isolated, multi-version
//! storage engine built around a delta-main layout: a compacted,
//! read-optimized *main* tier of multi-version records, and a *delta*
//! tier of two append-only logs that buffer recent inserts and
//! updates. Point reads merge both tiers under a snapshot descriptor;
//! writers place their entries optimistically and arbitrate conflicts
//! after the fact; a background sweep folds the delta into a freshly
//! rewritten main tier and publishes it atomically.
//!
//! ```
//! use deltastore::{Config, FieldType, GenericTuple, Schema, SnapshotDescriptor, Store};
//! use std::sync::Arc;
//!
//! struct NoTransactions;
//!
//! impl deltastore::MinVersionSource for NoTransactions {
//!     fn min_version(&self) -> u64 {
//!         u64::MAX
//!     }
//! }
//!
//! let config = Config::default()
//!     .total_memory(16 * 1024 * 1024)
//!     .page_size(64 * 1024)
//!     .hash_capacity(1 << 12);
//! let store = Store::new(config, Arc::new(NoTransactions)).unwrap();
//!
//! let mut schema = Schema::default();
//! schema.add_field(FieldType::Int, "foo", true);
//! let table = store.create_table("numbers", schema.clone()).unwrap();
//!
//! let snapshot = SnapshotDescriptor::new(1, 0);
//! let tuple = GenericTuple::default().set("foo", 12i32);
//! store.insert(table, 7, &schema.create(&tuple).unwrap(), &snapshot).unwrap();
//!
//! let foo = store
//!     .get(table, 7, &snapshot, |data, _version, _is_newest| {
//!         schema.field_int(data, 0).unwrap().unwrap()
//!     })
//!     .unwrap();
//! assert_eq!(foo, 12);
//! ```

#![deny(unsafe_code)]

mod config;
mod hash_table;
mod log;
mod page;
mod page_manager;
mod record;
mod result;
mod schema;
mod snapshot;
mod store;
mod table;

pub use self::config::Config;
pub use self::hash_table::{EMPTY_KEY, TOMBSTONE_KEY};
pub use self::result::{Error, Result};
pub use self::schema::{FieldType, GenericTuple, Schema, Value};
pub use self::snapshot::{MinVersionSource, SnapshotDescriptor};
pub use self::store::Store;
pub use self::table::Table;

/// A 64-bit record key. The values [`EMPTY_KEY`] and [`TOMBSTONE_KEY`]
/// are reserved by the hash table and rejected on writes.
pub type Key = u64;

/// A 64-bit transaction timestamp, assigned monotonically by the
/// commit manager. Version `0` is reserved and never visible.
pub type Version = u64;

/// Identifier of a table inside a [`Store`].
pub type TableId = u64;
