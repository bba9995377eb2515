//! The delta-main table engine: a hash-indexed main tier of compacted
//! multi-version records, two append-only delta logs buffering recent
//! writes, and the sweep that periodically folds the delta back into
//! a freshly published main tier.

#![allow(unsafe_code)]

use std::hint::spin_loop;
use std::sync::atomic::Ordering::{AcqRel, Acquire};
use std::sync::Arc;

use crossbeam_epoch::{pin, Atomic, Guard, Owned, Shared};
use ::log::{debug, trace};
use parking_lot::Mutex;

use crate::hash_table::{is_reserved, HashTable};
use crate::log::{Log, LogEntry};
use crate::page::{page_records, InsertMap, Rewriter};
use crate::page_manager::PageManager;
use crate::record::{Record, RecordKind, Visibility, HEADER_LEN};
use crate::schema::Schema;
use crate::snapshot::SnapshotDescriptor;
use crate::{Error, Key, Result, Version};

/// The read-optimized half of a table: the page list and the hash
/// index over it. Replaced wholesale by the collector so readers see
/// either the old tier or the new one, never a mix.
struct MainTier {
    hash: HashTable,
    pages: Vec<*mut u8>,
}

unsafe impl Send for MainTier {}
unsafe impl Sync for MainTier {}

/// A single table: snapshot-isolated point reads and optimistic
/// writes over a typed schema.
pub struct Table {
    schema: Schema,
    pm: Arc<PageManager>,
    insert_log: Log,
    update_log: Log,
    main: Atomic<MainTier>,
    // one sweep at a time; writers and readers never take this
    gc_lock: Mutex<()>,
}

impl Table {
    pub(crate) fn new(pm: Arc<PageManager>, schema: Schema, hash_capacity: usize) -> Result<Table> {
        let insert_log = Log::new(Arc::clone(&pm))?;
        let update_log = Log::new(Arc::clone(&pm))?;
        Ok(Table {
            schema,
            pm,
            insert_log,
            update_log,
            main: Atomic::new(MainTier {
                hash: HashTable::new(hash_capacity),
                pages: Vec::new(),
            }),
            gc_lock: Mutex::new(()),
        })
    }

    /// The schema rows of this table must conform to.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn tier<'g>(&self, guard: &'g Guard) -> &'g MainTier {
        unsafe { self.main.load(Acquire, guard).deref() }
    }

    /// Read the newest version of `key` visible to `snapshot` and pass
    /// it to `f` along with its version and whether anything newer
    /// exists. The payload borrow is only valid inside `f`.
    pub fn get<R>(
        &self,
        key: Key,
        snapshot: &SnapshotDescriptor,
        f: impl FnOnce(&[u8], Version, bool) -> R,
    ) -> Result<R> {
        if is_reserved(key) {
            return Err(Error::ReservedKey);
        }
        let guard = &pin();
        // the iterator is captured before the tier so a concurrent
        // sweep cannot publish and truncate in between
        let iter = self.insert_log.iter(guard);
        let tier = self.tier(guard);

        if let Some(addr) = tier.hash.get(key) {
            match Record::from_addr(addr).read(snapshot, guard) {
                Visibility::Found {
                    data,
                    version,
                    is_newest,
                } => return Ok(f(data, version, is_newest)),
                // a deleted head may hide a newer insert that only
                // lives in the log; keep looking
                Visibility::Deleted { is_newest: true } | Visibility::Dropped => {}
                Visibility::Deleted { is_newest: false } => return Err(Error::NotFound),
                Visibility::NotInSnapshot => return Err(Error::NotInSnapshot),
            }
        }

        for entry in iter {
            if !entry.sealed() {
                continue;
            }
            let record = entry.record();
            if !record.is_valid_data_record() || record.key() != key {
                continue;
            }
            match record.read(snapshot, guard) {
                Visibility::Found {
                    data,
                    version,
                    is_newest,
                } => return Ok(f(data, version, is_newest)),
                // deleted and then possibly re-inserted further down
                // the log; keep scanning
                Visibility::Deleted { is_newest: true } | Visibility::Dropped => continue,
                Visibility::Deleted { is_newest: false } => return Err(Error::NotFound),
                Visibility::NotInSnapshot => return Err(Error::NotInSnapshot),
            }
        }
        Err(Error::NotFound)
    }

    /// Insert `key` with `payload`. Uniqueness across concurrent
    /// inserters is arbitrated by log append order: the entry is
    /// appended optimistically and the log re-scanned from a position
    /// captured before the main-tier check; the first sealed entry for
    /// the key wins, later ones revert themselves.
    pub fn insert(&self, key: Key, payload: &[u8], snapshot: &SnapshotDescriptor) -> Result<()> {
        if is_reserved(key) {
            return Err(Error::ReservedKey);
        }
        self.schema.validate(payload)?;
        let guard = &pin();
        let iter = self.insert_log.iter(guard);
        let tier = self.tier(guard);

        if let Some(addr) = tier.hash.get(key) {
            match Record::from_addr(addr).read(snapshot, guard) {
                // only a tuple whose newest version is a visible
                // delete (or that was collected away) may come back
                Visibility::Deleted { is_newest: true } | Visibility::Dropped => {}
                _ => return Err(Error::AlreadyExists),
            }
        }

        let entry = self.insert_log.append(HEADER_LEN + payload.len())?;
        let record = entry.record();
        record.init(RecordKind::Insert, key, snapshot.version(), payload);

        for other in iter {
            if other == entry {
                entry.seal();
                return Ok(());
            }
            while !other.sealed() {
                spin_loop();
            }
            let competitor = other.record();
            if !competitor.is_valid_data_record() || competitor.key() != key {
                continue;
            }
            match competitor.read(snapshot, guard) {
                // the earlier entry is dead; it does not block us
                Visibility::Deleted { is_newest: true } | Visibility::Dropped => continue,
                _ => {
                    record.set_reverted();
                    entry.seal();
                    return Err(Error::AlreadyExists);
                }
            }
        }
        unreachable!("the scan must terminate at our own log entry");
    }

    /// Replace the visible version of `key` with `payload`.
    pub fn update(&self, key: Key, payload: &[u8], snapshot: &SnapshotDescriptor) -> Result<()> {
        self.schema.validate(payload)?;
        self.generic_update(key, RecordKind::Update, payload, snapshot)
    }

    /// Mark `key` deleted as of the snapshot's version.
    pub fn remove(&self, key: Key, snapshot: &SnapshotDescriptor) -> Result<()> {
        self.generic_update(key, RecordKind::Delete, &[], snapshot)
    }

    fn locate(
        &self,
        key: Key,
        snapshot: &SnapshotDescriptor,
        iter: impl Iterator<Item = LogEntry>,
        guard: &Guard,
    ) -> Result<Record> {
        let tier = self.tier(guard);
        if let Some(addr) = tier.hash.get(key) {
            let record = Record::from_addr(addr);
            match record.read(snapshot, guard) {
                Visibility::Found { .. } => return Ok(record),
                // fall through: the key may have been re-inserted and
                // only exist in the log
                Visibility::Deleted { is_newest: true } | Visibility::Dropped => {}
                Visibility::Deleted { is_newest: false } => return Err(Error::NotFound),
                Visibility::NotInSnapshot => return Err(Error::NotInSnapshot),
            }
        }
        for entry in iter {
            if !entry.sealed() {
                continue;
            }
            let record = entry.record();
            if !record.is_valid_data_record() || record.key() != key {
                continue;
            }
            match record.read(snapshot, guard) {
                Visibility::Found { .. } => return Ok(record),
                Visibility::Deleted { is_newest: true } | Visibility::Dropped => continue,
                Visibility::Deleted { is_newest: false } => return Err(Error::NotFound),
                Visibility::NotInSnapshot => return Err(Error::NotInSnapshot),
            }
        }
        Err(Error::NotFound)
    }

    fn generic_update(
        &self,
        key: Key,
        kind: RecordKind,
        payload: &[u8],
        snapshot: &SnapshotDescriptor,
    ) -> Result<()> {
        if is_reserved(key) {
            return Err(Error::ReservedKey);
        }
        let guard = &pin();
        let iter = self.insert_log.iter(guard);
        let base = self.locate(key, snapshot, iter, guard)?;
        // the record may have been relocated by a sweep since the
        // lookup; extend the chain where it lives now
        let base = base.resolve().ok_or(Error::NotFound)?;

        let entry = self.update_log.append(HEADER_LEN + payload.len())?;
        let record = entry.record();
        record.init(kind, key, snapshot.version(), payload);
        match base.update(record, snapshot) {
            Ok(()) => {
                entry.seal();
                Ok(())
            }
            Err(e) => {
                record.set_reverted();
                entry.seal();
                Err(e)
            }
        }
    }

    /// Roll back this snapshot's own version of `key`, wherever it
    /// lives: delta entries are flagged, versions already folded into
    /// a main record have their slot cleared.
    pub fn revert(&self, key: Key, snapshot: &SnapshotDescriptor) -> Result<()> {
        if is_reserved(key) {
            return Err(Error::ReservedKey);
        }
        let guard = &pin();
        let iter = self.insert_log.iter(guard);
        let tier = self.tier(guard);
        let version = snapshot.version();

        let mut found = Err(Error::NotFound);
        if let Some(addr) = tier.hash.get(key) {
            found = Record::from_addr(addr).revert(version);
        }
        if found == Err(Error::NotFound) {
            for entry in iter {
                if !entry.sealed() {
                    continue;
                }
                let record = entry.record();
                if record.key() != key || record.absorbed() {
                    continue;
                }
                match record.revert(version) {
                    Err(Error::NotFound) => continue,
                    result => {
                        found = result;
                        break;
                    }
                }
            }
        }
        found
    }

    /// Rewrite the main tier with watermark `min_version`: fold the
    /// absorbed delta into fresh pages, drop what no live snapshot can
    /// see, publish the new tier in one swap and truncate the logs.
    pub fn run_gc(&self, min_version: Version) -> Result<()> {
        let _sweep = self.gc_lock.lock();
        let guard = &pin();

        // positions captured up front bound what this sweep may free
        let update_pos = self.update_log.position();
        let mut insert_iter = self.insert_log.iter(guard);

        let mut insert_map = InsertMap::new();
        let insert_stop;
        let mut reached_tail = true;
        loop {
            let pos = insert_iter.position();
            let entry = match insert_iter.next() {
                Some(entry) => entry,
                None => {
                    insert_stop = pos;
                    break;
                }
            };
            if !entry.sealed() {
                // everything past an in-flight writer stays for the
                // next sweep
                insert_stop = pos;
                reached_tail = false;
                break;
            }
            let record = entry.record();
            if !record.is_valid_data_record() || record.absorbed() {
                continue;
            }
            insert_map
                .entry(record.key())
                .or_default()
                .push(record.addr());
        }

        let tier = self.tier(guard);
        let needed = tier.hash.len() + insert_map.len();
        if needed > tier.hash.capacity() / 8 * 7 {
            return Err(Error::OutOfMemory);
        }

        let new_hash = HashTable::new(tier.hash.capacity());
        let mut rewriter = Rewriter::new(&self.pm, min_version)?;
        let mut bases = Vec::new();
        for &page in &tier.pages {
            for record in page_records(page) {
                bases.clear();
                bases.push(record);
                if let Some(pending) = insert_map.remove(&record.key()) {
                    bases.extend(pending.iter().map(|addr| Record::from_addr(*addr)));
                }
                if let Some(addr) = rewriter.rewrite(&bases) {
                    assert!(new_hash.put(record.key(), addr));
                }
            }
        }
        // keys that never had a main-tier home, in key order
        for (key, pending) in std::mem::take(&mut insert_map) {
            bases.clear();
            bases.extend(pending.iter().map(|addr| Record::from_addr(*addr)));
            if let Some(addr) = rewriter.rewrite(&bases) {
                assert!(new_hash.put(key, addr));
            }
        }
        let new_pages = rewriter.finish();

        debug!(
            "gc published {} pages holding {} keys at watermark {}",
            new_pages.len(),
            new_hash.len(),
            min_version
        );

        let old = self.main.swap(
            Owned::new(MainTier {
                hash: new_hash,
                pages: new_pages,
            }),
            AcqRel,
            guard,
        );
        let pm = Arc::clone(&self.pm);
        let retired = old.as_raw() as usize;
        unsafe {
            guard.defer_unchecked(move || {
                let tier = Box::from_raw(retired as *mut MainTier);
                for page in &tier.pages {
                    pm.free(*page);
                }
            });
        }

        self.insert_log.truncate(insert_stop, guard);
        if reached_tail {
            // with no in-flight insert every reachable update entry
            // was folded above, so the absorbed prefix can go too
            self.update_log.truncate(update_pos, guard);
        } else {
            trace!("gc kept the update log; an insert was in flight");
        }
        Ok(())
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            let tier = self.main.swap(Shared::null(), AcqRel, guard);
            if !tier.is_null() {
                let tier = tier.into_owned();
                for page in &tier.pages {
                    self.pm.free(*page);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Table {
        let pm = Arc::new(PageManager::new(256 * 4096, 4096));
        Table::new(pm, Schema::default(), 1 << 10).unwrap()
    }

    fn snapshot(version: Version, base: Version) -> SnapshotDescriptor {
        SnapshotDescriptor::new(version, base)
    }

    fn get_vec(table: &Table, key: Key, snapshot: &SnapshotDescriptor) -> Result<Vec<u8>> {
        table.get(key, snapshot, |data, _, _| data.to_vec())
    }

    #[test]
    fn insert_get_update_remove() {
        let table = table();
        let tx1 = snapshot(10, 9);

        table.insert(1, b"one", &tx1).unwrap();
        assert_eq!(get_vec(&table, 1, &tx1).unwrap(), b"one");
        assert_eq!(table.insert(1, b"dup", &tx1), Err(Error::AlreadyExists));

        let tx2 = snapshot(11, 10);
        table.update(1, b"uno", &tx2).unwrap();
        assert_eq!(get_vec(&table, 1, &tx2).unwrap(), b"uno");
        // the older snapshot is unaffected
        assert_eq!(get_vec(&table, 1, &tx1).unwrap(), b"one");

        let tx3 = snapshot(12, 11);
        table.remove(1, &tx3).unwrap();
        assert_eq!(get_vec(&table, 1, &tx3), Err(Error::NotFound));
        assert_eq!(get_vec(&table, 1, &tx2).unwrap(), b"uno");
    }

    #[test]
    fn uncommitted_writes_are_fenced() {
        let table = table();
        let tx1 = snapshot(10, 9);
        table.insert(1, b"pending", &tx1).unwrap();

        // tx2 began before tx1 committed: version 10 is in flight
        let tx2 = snapshot(11, 9);
        assert_eq!(get_vec(&table, 1, &tx2), Err(Error::NotInSnapshot));
        assert_eq!(table.insert(1, b"mine", &tx2), Err(Error::AlreadyExists));
        assert_eq!(
            table.update(1, b"mine", &tx2),
            Err(Error::NotInSnapshot)
        );
        assert_eq!(table.remove(1, &tx2), Err(Error::NotInSnapshot));
    }

    #[test]
    fn reserved_keys_are_rejected() {
        let table = table();
        let tx = snapshot(5, 4);
        assert_eq!(
            table.insert(crate::EMPTY_KEY, b"", &tx),
            Err(Error::ReservedKey)
        );
        assert_eq!(
            table.remove(crate::TOMBSTONE_KEY, &tx),
            Err(Error::ReservedKey)
        );
    }

    #[test]
    fn delete_then_reinsert_in_the_log() {
        let table = table();
        table.insert(7, b"first", &snapshot(5, 4)).unwrap();
        table.remove(7, &snapshot(8, 7)).unwrap();
        table.insert(7, b"second", &snapshot(10, 9)).unwrap();

        let read = snapshot(12, 11);
        table
            .get(7, &read, |data, version, is_newest| {
                assert_eq!(data, b"second");
                assert_eq!(version, 10);
                assert!(is_newest);
            })
            .unwrap();
    }

    #[test]
    fn revert_hides_own_version() {
        let table = table();
        let tx1 = snapshot(5, 4);
        table.insert(3, b"keep", &tx1).unwrap();

        let tx2 = snapshot(8, 7);
        table.update(3, b"oops", &tx2).unwrap();
        table.revert(3, &tx2).unwrap();

        assert_eq!(get_vec(&table, 3, &snapshot(9, 8)).unwrap(), b"keep");
        assert_eq!(table.revert(3, &snapshot(10, 9)), Err(Error::NotFound));
    }

    #[test]
    fn gc_preserves_visible_history() {
        let table = table();
        table.insert(1, b"v2", &snapshot(2, 1)).unwrap();
        table.update(1, b"v5", &snapshot(5, 4)).unwrap();
        table.update(1, b"v8", &snapshot(8, 7)).unwrap();
        table.update(1, b"v11", &snapshot(11, 10)).unwrap();

        let old_reader = snapshot(9, 8);
        let new_reader = snapshot(12, 11);

        table.run_gc(8).unwrap();

        assert_eq!(get_vec(&table, 1, &old_reader).unwrap(), b"v8");
        assert_eq!(get_vec(&table, 1, &new_reader).unwrap(), b"v11");
        // v5 stands in for everything below the watermark; v2 is gone
        let guard = &pin();
        let tier = table.tier(guard);
        let addr = tier.hash.get(1).unwrap();
        let record = Record::from_addr(addr);
        assert_eq!(record.main_count(), 3);
        assert_eq!(record.main_version(2), 5);
    }

    #[test]
    fn gc_is_transparent_to_deletes_and_reinserts() {
        let table = table();
        table.insert(7, b"a", &snapshot(5, 4)).unwrap();
        table.remove(7, &snapshot(8, 7)).unwrap();
        table.run_gc(6).unwrap();

        // the tombstone survives, so the key reads as absent
        assert_eq!(get_vec(&table, 7, &snapshot(9, 8)), Err(Error::NotFound));

        table.insert(7, b"b", &snapshot(10, 9)).unwrap();
        assert_eq!(get_vec(&table, 7, &snapshot(11, 10)).unwrap(), b"b");

        // a second sweep folds the re-insert into the main tier
        table.run_gc(11).unwrap();
        table
            .get(7, &snapshot(12, 11), |data, version, is_newest| {
                assert_eq!(data, b"b");
                assert_eq!(version, 10);
                assert!(is_newest);
            })
            .unwrap();
    }

    #[test]
    fn gc_drops_fully_dead_keys() {
        let table = table();
        table.insert(9, b"x", &snapshot(3, 2)).unwrap();
        table.remove(9, &snapshot(4, 3)).unwrap();
        table.run_gc(10).unwrap();

        assert_eq!(get_vec(&table, 9, &snapshot(11, 10)), Err(Error::NotFound));
        let guard = &pin();
        assert_eq!(table.tier(guard).hash.get(9), None);

        // and the key is free for reuse
        table.insert(9, b"y", &snapshot(12, 11)).unwrap();
        assert_eq!(get_vec(&table, 9, &snapshot(13, 12)).unwrap(), b"y");
    }

    #[test]
    fn updates_work_across_a_sweep() {
        let table = table();
        table.insert(2, b"before", &snapshot(5, 4)).unwrap();
        table.run_gc(6).unwrap();

        table.update(2, b"after", &snapshot(8, 7)).unwrap();
        assert_eq!(get_vec(&table, 2, &snapshot(9, 8)).unwrap(), b"after");
        assert_eq!(get_vec(&table, 2, &snapshot(6, 5)).unwrap(), b"before");

        table.run_gc(9).unwrap();
        assert_eq!(get_vec(&table, 2, &snapshot(10, 9)).unwrap(), b"after");
    }
}
