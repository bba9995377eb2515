//! The multi-table facade: table lifecycle by name, operation routing
//! by table id, and the garbage collection driver that sweeps every
//! table at the commit manager's watermark.

use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use fnv::FnvHashMap;
use ::log::{debug, warn};
use parking_lot::RwLock;

use crate::page_manager::PageManager;
use crate::schema::Schema;
use crate::snapshot::{MinVersionSource, SnapshotDescriptor};
use crate::table::Table;
use crate::{Config, Error, Key, Result, TableId, Version};

type Tables = RwLock<Vec<Arc<Table>>>;

/// An engine instance: a page arena shared by all tables, a name
/// registry, and an optional background collection thread.
///
/// All operations take the caller's [`SnapshotDescriptor`]; the store
/// itself holds no transaction state beyond the injected
/// [`MinVersionSource`] that tells the collector what is safe to
/// coalesce.
pub struct Store {
    pm: Arc<PageManager>,
    config: Config,
    tables: Arc<Tables>,
    names: RwLock<FnvHashMap<String, TableId>>,
    versions: Arc<dyn MinVersionSource>,
    shutdown: Arc<AtomicBool>,
    gc_thread: Option<thread::JoinHandle<()>>,
}

fn sweep(tables: &Tables, min_version: Version) -> Result<()> {
    let tables: Vec<_> = tables.read().iter().cloned().collect();
    for table in tables {
        table.run_gc(min_version)?;
    }
    Ok(())
}

impl Store {
    /// Bring up an engine. When [`Config::gc_every_ms`] is set, a
    /// named collector thread sweeps all tables on that interval until
    /// the store is dropped.
    pub fn new(config: Config, versions: Arc<dyn MinVersionSource>) -> Result<Store> {
        let pm = Arc::new(PageManager::new(config.total_memory, config.page_size));
        let tables: Arc<Tables> = Arc::new(RwLock::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let gc_thread = match config.gc_every_ms {
            Some(interval) => {
                // the collector holds only weak state so it can never
                // outlive or resurrect the store it works for
                let tables: Weak<Tables> = Arc::downgrade(&tables);
                let versions = Arc::clone(&versions);
                let shutdown = Arc::clone(&shutdown);
                let handle = thread::Builder::new()
                    .name("deltastore-gc".to_owned())
                    .spawn(move || {
                        while !shutdown.load(SeqCst) {
                            thread::sleep(Duration::from_millis(interval));
                            let Some(tables) = tables.upgrade() else { break };
                            if let Err(e) = sweep(&tables, versions.min_version()) {
                                warn!("background gc failed: {}", e);
                            }
                        }
                    })
                    .expect("spawning the gc thread");
                Some(handle)
            }
            None => None,
        };

        Ok(Store {
            pm,
            config,
            tables,
            names: RwLock::new(FnvHashMap::default()),
            versions,
            shutdown,
            gc_thread,
        })
    }

    /// Create a table under `name`, returning its id.
    pub fn create_table(&self, name: &str, schema: Schema) -> Result<TableId> {
        let mut names = self.names.write();
        if names.contains_key(name) {
            return Err(Error::AlreadyExists);
        }
        let table = Arc::new(Table::new(
            Arc::clone(&self.pm),
            schema,
            self.config.hash_capacity,
        )?);
        let mut tables = self.tables.write();
        tables.push(table);
        let id = tables.len() as TableId;
        names.insert(name.to_owned(), id);
        debug!("created table {} as id {}", name, id);
        Ok(id)
    }

    /// Look up the id of an existing table.
    pub fn table_id(&self, name: &str) -> Result<TableId> {
        self.names
            .read()
            .get(name)
            .copied()
            .ok_or(Error::TableDoesNotExist)
    }

    fn table(&self, id: TableId) -> Result<Arc<Table>> {
        self.tables
            .read()
            .get((id as usize).wrapping_sub(1))
            .cloned()
            .ok_or(Error::TableDoesNotExist)
    }

    /// Read the newest visible version of `key`; see [`Table::get`].
    pub fn get<R>(
        &self,
        table: TableId,
        key: Key,
        snapshot: &SnapshotDescriptor,
        f: impl FnOnce(&[u8], Version, bool) -> R,
    ) -> Result<R> {
        self.table(table)?.get(key, snapshot, f)
    }

    /// Insert a new tuple; see [`Table::insert`].
    pub fn insert(
        &self,
        table: TableId,
        key: Key,
        payload: &[u8],
        snapshot: &SnapshotDescriptor,
    ) -> Result<()> {
        self.table(table)?.insert(key, payload, snapshot)
    }

    /// Replace the visible tuple; see [`Table::update`].
    pub fn update(
        &self,
        table: TableId,
        key: Key,
        payload: &[u8],
        snapshot: &SnapshotDescriptor,
    ) -> Result<()> {
        self.table(table)?.update(key, payload, snapshot)
    }

    /// Delete the visible tuple; see [`Table::remove`].
    pub fn remove(&self, table: TableId, key: Key, snapshot: &SnapshotDescriptor) -> Result<()> {
        self.table(table)?.remove(key, snapshot)
    }

    /// Roll back the snapshot's own write; see [`Table::revert`].
    pub fn revert(&self, table: TableId, key: Key, snapshot: &SnapshotDescriptor) -> Result<()> {
        self.table(table)?.revert(key, snapshot)
    }

    /// Sweep every table now, using the injected watermark.
    pub fn force_gc(&self) -> Result<()> {
        sweep(&self.tables, self.versions.min_version())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.shutdown.store(true, SeqCst);
        if let Some(handle) = self.gc_thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedWatermark(Version);

    impl MinVersionSource for FixedWatermark {
        fn min_version(&self) -> Version {
            self.0
        }
    }

    fn store() -> Store {
        let config = Config::default()
            .total_memory(512 * 4096)
            .page_size(4096)
            .hash_capacity(1 << 10);
        Store::new(config, Arc::new(FixedWatermark(u64::MAX))).unwrap()
    }

    #[test]
    fn table_registry() {
        let store = store();
        let a = store.create_table("a", Schema::default()).unwrap();
        let b = store.create_table("b", Schema::default()).unwrap();
        assert_ne!(a, b);
        assert_eq!(store.table_id("a").unwrap(), a);
        assert_eq!(
            store.create_table("a", Schema::default()),
            Err(Error::AlreadyExists)
        );
        assert_eq!(store.table_id("missing"), Err(Error::TableDoesNotExist));
        assert_eq!(
            store.insert(99, 1, b"", &SnapshotDescriptor::new(1, 0)),
            Err(Error::TableDoesNotExist)
        );
    }

    #[test]
    fn operations_route_to_the_right_table() {
        let store = store();
        let a = store.create_table("a", Schema::default()).unwrap();
        let b = store.create_table("b", Schema::default()).unwrap();
        let tx = SnapshotDescriptor::new(3, 2);

        store.insert(a, 1, b"in-a", &tx).unwrap();
        assert_eq!(
            store.get(b, 1, &tx, |data, _, _| data.to_vec()),
            Err(Error::NotFound)
        );
        assert_eq!(
            store.get(a, 1, &tx, |data, _, _| data.to_vec()).unwrap(),
            b"in-a"
        );

        store.force_gc().unwrap();
        assert_eq!(
            store.get(a, 1, &tx, |data, _, _| data.to_vec()).unwrap(),
            b"in-a"
        );
    }

    #[test]
    fn background_collector_runs_and_shuts_down() {
        let config = Config::default()
            .total_memory(512 * 4096)
            .page_size(4096)
            .hash_capacity(128)
            .gc_every_ms(Some(5));
        let store = Store::new(config, Arc::new(FixedWatermark(u64::MAX))).unwrap();
        let table = store.create_table("t", Schema::default()).unwrap();
        let tx = SnapshotDescriptor::new(2, 1);
        store.insert(table, 1, b"v", &tx).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(
            store.get(table, 1, &tx, |data, _, _| data.to_vec()).unwrap(),
            b"v"
        );
        drop(store);
    }
}
